//! Remote object store client interface
//!
//! The engine never speaks a wire protocol itself. Request signing,
//! response parsing and percent-encoding belong to the implementation
//! behind [`RemoteStore`]; the engine only sees these calls and the
//! [`StoreError`] classification they report.

pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

pub use memory::{MemoryStore, StoreOperation, StoreStats};

/// Object body, produced or consumed chunk by chunk
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Network-level failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    ConnectionReset,
    ConnectionAborted,
    TimedOut,
    BrokenPipe,
    UnexpectedEof,
    Tls,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ConnectionReset => "connection reset",
            Self::ConnectionAborted => "connection aborted",
            Self::TimedOut => "timed out",
            Self::BrokenPipe => "broken pipe",
            Self::UnexpectedEof => "unexpected end of stream",
            Self::Tls => "TLS failure",
        };
        f.write_str(text)
    }
}

/// Errors reported by a remote store client
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The connection failed underneath the request
    #[error("{kind}: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// The store answered with a non-2xx status
    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        message: String,
        /// Redirect target for 301/307 answers
        location: Option<String>,
    },

    /// Reading or writing the local side of a body failed
    #[error("local I/O error: {0}")]
    Local(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
            location: None,
        }
    }

    pub fn redirect(status: u16, location: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: "redirect".to_string(),
            location: Some(location.into()),
        }
    }

    /// Map an I/O error raised while moving a body over the network
    pub fn from_network_io(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionReset => TransportErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted => TransportErrorKind::ConnectionAborted,
            io::ErrorKind::TimedOut => TransportErrorKind::TimedOut,
            io::ErrorKind::BrokenPipe => TransportErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof => TransportErrorKind::UnexpectedEof,
            _ => return Self::Other(err.to_string()),
        };
        Self::transport(kind, err.to_string())
    }

    /// Failures that consume retry budget and are attempted again
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }

    /// Failures after which the cached connection must not be reused
    pub fn breaks_connection(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One leaf object from a listing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    /// ETag as sent by the store, possibly quoted
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    pub prefix: String,
    pub delimiter: Option<String>,
    /// Resume after this key
    pub marker: Option<String>,
    pub max_keys: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    /// Sub-prefixes ending in the delimiter
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

/// Result of a HEAD call, also returned with GET
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    /// User metadata without any protocol prefix
    pub user: HashMap<String, String>,
}

pub struct GetObject {
    pub metadata: ObjectMetadata,
    pub body: ByteStream,
}

pub struct PutObject {
    pub body: ByteStream,
    pub content_length: u64,
    /// User metadata (`owner`, `group`, `permissions`, `symlink`)
    pub metadata: HashMap<String, String>,
    /// Request headers such as `x-amz-acl` or `Cache-Control`
    pub headers: Vec<(String, String)>,
}

/// Factory for bucket-scoped connections
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Open a connection to `bucket`, optionally against a specific host
    async fn connect(&self, bucket: &str, host: Option<&str>) -> StoreResult<Arc<dyn StoreConnection>>;
}

/// Calls against one bucket.
///
/// A `put` must be atomic from a reader's point of view: either the
/// complete object becomes visible or nothing does.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    async fn list(&self, request: &ListRequest) -> StoreResult<ListPage>;
    async fn get(&self, key: &str) -> StoreResult<GetObject>;
    async fn head(&self, key: &str) -> StoreResult<ObjectMetadata>;
    async fn put(&self, key: &str, object: PutObject) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Strip the quotes some stores wrap around ETags
pub fn normalize_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(StoreError::transport(TransportErrorKind::ConnectionReset, "reset"), true ; "reset")]
    #[test_case(StoreError::transport(TransportErrorKind::Tls, "handshake"), true ; "tls")]
    #[test_case(StoreError::status(500, "InternalError"), true ; "internal error")]
    #[test_case(StoreError::status(503, "SlowDown"), true ; "slow down")]
    #[test_case(StoreError::status(404, "NoSuchKey"), false ; "not found")]
    #[test_case(StoreError::status(403, "AccessDenied"), false ; "forbidden")]
    #[test_case(StoreError::redirect(307, "https://elsewhere/"), false ; "temporary redirect")]
    #[test_case(StoreError::Other("bad".into()), false ; "other")]
    fn test_transient_classification(error: StoreError, transient: bool) {
        assert_eq!(error.is_transient(), transient);
    }

    #[test]
    fn test_network_io_mapping() {
        let err = StoreError::from_network_io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(matches!(
            err,
            StoreError::Transport { kind: TransportErrorKind::UnexpectedEof, .. }
        ));
        let err = StoreError::from_network_io(io::Error::new(io::ErrorKind::InvalidData, "junk"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_normalize_etag() {
        assert_eq!(normalize_etag("\"abc\""), "abc");
        assert_eq!(normalize_etag("abc"), "abc");
    }
}
