//! Error types for the sync engine library

use std::path::PathBuf;

use crate::metrics::SyncMetrics;
use crate::store::StoreError;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Comprehensive error type for sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad locations, both or neither endpoint remote, invalid session settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Path-related errors
    #[error("Path error at '{path}': {message}")]
    Path { path: PathBuf, message: String },

    /// Exclusion pattern errors
    #[error("Filter pattern error: {0}")]
    FilterPattern(String),

    /// Hash computation errors
    #[error("Hash computation error for '{path}': {message}")]
    Hash { path: PathBuf, message: String },

    /// A single remote call failed without being retried further
    #[error("Remote {operation} failed for '{key}': {source}")]
    Store {
        operation: String,
        key: String,
        #[source]
        source: StoreError,
    },

    /// Listing a remote prefix failed; the traversal cannot continue
    #[error("Remote namespace unavailable at '{bucket}:{prefix}': {message}")]
    RemoteUnavailable {
        bucket: String,
        prefix: String,
        message: String,
    },

    /// The shared retry budget reached zero
    #[error("Ran out of retries during {operation} of '{key}'")]
    RetryBudgetExhausted { operation: String, key: String },

    /// Progress reporting errors
    #[error("Progress reporting error: {0}")]
    Progress(String),

    /// File attribute preservation errors
    #[error("Attribute preservation error for '{path}': {message}")]
    AttributePreservation { path: PathBuf, message: String },

    /// File transfer errors
    #[error("File transfer error: {message}")]
    Transfer { message: String },

    /// File deletion errors
    #[error("File deletion error at '{path}': {message}")]
    FileDeletion { path: PathBuf, message: String },

    /// Cancellation error
    #[error("Operation was cancelled")]
    Cancelled,

    /// A run stopped early; `metrics` holds what was applied before it stopped
    #[error("Sync did not complete: {cause}")]
    Incomplete {
        cause: Box<SyncError>,
        metrics: Box<SyncMetrics>,
    },
}

impl SyncError {
    /// Create a new configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a new path error
    pub fn path_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Path {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new hash error
    pub fn hash_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Hash {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new remote call error
    pub fn store_error(
        operation: impl Into<String>,
        key: impl Into<String>,
        source: StoreError,
    ) -> Self {
        Self::Store {
            operation: operation.into(),
            key: key.into(),
            source,
        }
    }

    /// Create a new attribute preservation error
    pub fn attribute_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::AttributePreservation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new transfer error
    pub fn transfer_error(
        source: impl std::fmt::Display,
        dest: impl std::fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Self::Transfer {
            message: format!("'{}' to '{}': {}", source, dest, message.into()),
        }
    }

    /// Create a new file deletion error
    pub fn deletion_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::FileDeletion {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Errors that stop the whole run rather than a single item
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RetryBudgetExhausted { .. }
                | Self::RemoteUnavailable { .. }
                | Self::Cancelled
                | Self::Incomplete { .. }
        )
    }
}

impl From<regex::Error> for SyncError {
    fn from(err: regex::Error) -> Self {
        Self::FilterPattern(err.to_string())
    }
}
