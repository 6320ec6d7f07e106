//! The unit of comparison: one file, symlink or directory marker

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::warn;

use crate::comparator::fingerprint_file;
use crate::error::Result;
use crate::preservation::NodeMetadata;
use crate::session::SyncSession;
use crate::store::{normalize_etag, ObjectEntry, ObjectMetadata};

/// Body stored for a directory. Object stores have no directories, so each
/// local directory becomes an object holding exactly this text.
pub const DIRECTORY_MARKER_PAYLOAD: &str = "{E40327BF-517A-46e8-A6C3-AF51BC263F59}";

/// MD5 of [`DIRECTORY_MARKER_PAYLOAD`], i.e. the marker's ETag
pub const DIRECTORY_MARKER_TAG: &str = "d66759af42f282e1ba19144df2d405d0";

pub const DIRECTORY_MARKER_SIZE: u64 = DIRECTORY_MARKER_PAYLOAD.len() as u64;

/// One comparable item in either namespace
#[derive(Debug)]
pub enum Node {
    Local(LocalNode),
    Remote(RemoteNode),
}

impl Node {
    /// Path relative to the namespace root, `/`-separated, empty for the root itself
    pub fn name(&self) -> &str {
        match self {
            Node::Local(node) => &node.name,
            Node::Remote(node) => &node.name,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Node::Local(node) => node.size,
            Node::Remote(node) => node.size,
        }
    }

    pub fn modified(&self) -> DateTime<Utc> {
        match self {
            Node::Local(node) => node.modified,
            Node::Remote(node) => node.modified,
        }
    }

    pub fn is_directory_marker(&self) -> bool {
        match self {
            Node::Local(node) => node.is_directory_marker(),
            Node::Remote(node) => node.is_directory_marker(),
        }
    }

    /// Content hash or ETag. Local files are hashed on first call.
    pub async fn fingerprint(&self) -> Option<&str> {
        match self {
            Node::Local(node) => node.fingerprint().await,
            Node::Remote(node) => Some(node.etag()),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Node::Local(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalKind {
    File,
    Directory,
    Symlink { target: String },
}

/// A filesystem entry, described from `lstat`
#[derive(Debug)]
pub struct LocalNode {
    name: String,
    path: PathBuf,
    kind: LocalKind,
    size: u64,
    modified: DateTime<Utc>,
    metadata: NodeMetadata,
    fingerprinting: bool,
    fingerprint: OnceCell<Option<String>>,
}

impl LocalNode {
    /// Describe `path`. Returns `Ok(None)` for sockets, fifos and devices.
    ///
    /// Symlinks are detected before anything else, so a link to a file or a
    /// directory is always a link node.
    pub async fn from_path(
        path: impl Into<PathBuf>,
        name: impl Into<String>,
        fingerprinting: bool,
    ) -> io::Result<Option<Self>> {
        let path = path.into();
        let stat = fs::symlink_metadata(&path).await?;
        let file_type = stat.file_type();

        let (kind, size, fingerprint) = if file_type.is_symlink() {
            let target = fs::read_link(&path).await?.to_string_lossy().into_owned();
            let tag = hex::encode(Md5::digest(target.as_bytes()));
            let size = target.len() as u64;
            (LocalKind::Symlink { target }, size, OnceCell::new_with(Some(Some(tag))))
        } else if file_type.is_dir() {
            (
                LocalKind::Directory,
                DIRECTORY_MARKER_SIZE,
                OnceCell::new_with(Some(Some(DIRECTORY_MARKER_TAG.to_string()))),
            )
        } else if file_type.is_file() {
            (LocalKind::File, stat.len(), OnceCell::new())
        } else {
            return Ok(None);
        };

        let modified = stat
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::UNIX_EPOCH);

        Ok(Some(Self {
            name: name.into(),
            metadata: NodeMetadata::from_std(&stat),
            path,
            kind,
            size,
            modified,
            fingerprinting,
            fingerprint,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes an upload sends: file length, link target length or the marker payload
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> &LocalKind {
        &self.kind
    }

    pub fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    pub fn is_directory_marker(&self) -> bool {
        self.kind == LocalKind::Directory
    }

    pub fn symlink_target(&self) -> Option<&str> {
        match &self.kind {
            LocalKind::Symlink { target } => Some(target),
            _ => None,
        }
    }

    pub async fn fingerprint(&self) -> Option<&str> {
        if !self.fingerprinting && !self.is_directory_marker() {
            return None;
        }
        self.fingerprint
            .get_or_init(|| async {
                match fingerprint_file(&self.path).await {
                    Ok(tag) => Some(tag),
                    Err(e) => {
                        warn!("{}", e);
                        None
                    }
                }
            })
            .await
            .as_deref()
    }
}

/// An object from a listing. Ownership metadata is fetched on demand.
#[derive(Debug)]
pub struct RemoteNode {
    bucket: String,
    key: String,
    name: String,
    size: u64,
    etag: String,
    modified: DateTime<Utc>,
    metadata: OnceCell<NodeMetadata>,
}

impl RemoteNode {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        etag: &str,
        modified: DateTime<Utc>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            name: name.into(),
            size,
            etag: normalize_etag(etag),
            modified,
            metadata: OnceCell::new(),
        }
    }

    pub fn from_entry(bucket: &str, entry: ObjectEntry, name: impl Into<String>) -> Self {
        Self::new(bucket, entry.key, name, entry.size, &entry.etag, entry.last_modified)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    /// Our own markers, plus the empty `name/` keys other tools create for folders
    pub fn is_directory_marker(&self) -> bool {
        (self.etag == DIRECTORY_MARKER_TAG && self.size == DIRECTORY_MARKER_SIZE)
            || self.key.ends_with('/')
    }

    /// Ownership, permissions and symlink flag, via HEAD on first use
    pub async fn metadata(&self, session: &SyncSession) -> Result<NodeMetadata> {
        let metadata = self
            .metadata
            .get_or_try_init(|| async {
                let head: ObjectMetadata = session
                    .call(&self.bucket, "head", &self.key, |conn| {
                        let key = self.key.clone();
                        async move { conn.head(&key).await }
                    })
                    .await?;
                Ok::<_, crate::error::SyncError>(NodeMetadata::from_headers(&head.user))
            })
            .await?;
        Ok(*metadata)
    }

    /// Record metadata that arrived with a GET so no HEAD is needed
    pub fn remember_metadata(&self, metadata: NodeMetadata) {
        let _ = self.metadata.set(metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marker_tag_is_md5_of_payload() {
        assert_eq!(DIRECTORY_MARKER_SIZE, 38);
        assert_eq!(
            hex::encode(Md5::digest(DIRECTORY_MARKER_PAYLOAD.as_bytes())),
            DIRECTORY_MARKER_TAG
        );
    }

    #[test]
    fn test_remote_marker_detection() {
        let now = Utc::now();
        let marker = RemoteNode::new("b", "p/d", "d", 38, &format!("\"{}\"", DIRECTORY_MARKER_TAG), now);
        assert!(marker.is_directory_marker());
        assert_eq!(marker.etag(), DIRECTORY_MARKER_TAG);

        let wrong_size = RemoteNode::new("b", "p/d", "d", 39, DIRECTORY_MARKER_TAG, now);
        assert!(!wrong_size.is_directory_marker());

        let folder = RemoteNode::new("b", "p/d/", "d/", 0, "d41d8cd98f00b204e9800998ecf8427e", now);
        assert!(folder.is_directory_marker());
    }

    #[tokio::test]
    async fn test_local_file_node_hashes_lazily() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("hello.txt");
        fs::write(&path, b"hello").await.unwrap();

        let node = LocalNode::from_path(&path, "hello.txt", true).await.unwrap().unwrap();
        assert_eq!(node.kind(), &LocalKind::File);
        assert_eq!(node.fingerprint.get(), None);
        assert_eq!(node.fingerprint().await, Some("5d41402abc4b2a76b9719d911017c592"));

        let unhashed = LocalNode::from_path(&path, "hello.txt", false).await.unwrap().unwrap();
        assert_eq!(unhashed.fingerprint().await, None);
        assert_eq!(Node::Local(unhashed).size(), 5);
    }

    #[tokio::test]
    async fn test_local_directory_is_a_marker() {
        let temp_dir = TempDir::new().unwrap();
        let node = LocalNode::from_path(temp_dir.path(), "", false).await.unwrap().unwrap();
        assert!(node.is_directory_marker());
        assert_eq!(node.fingerprint().await, Some(DIRECTORY_MARKER_TAG));
        assert_eq!(Node::Local(node).size(), DIRECTORY_MARKER_SIZE);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_detected_before_target_type() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("real")).await.unwrap();
        let link = temp_dir.path().join("link");
        fs::symlink("real", &link).await.unwrap();

        let node = LocalNode::from_path(&link, "link", true).await.unwrap().unwrap();
        assert_eq!(node.symlink_target(), Some("real"));
        assert!(!node.is_directory_marker());
        assert!(node.metadata().symlink);

        let node = Node::Local(node);
        assert_eq!(node.size(), 4);
        assert_eq!(
            node.fingerprint().await.map(str::to_string),
            Some(hex::encode(Md5::digest(b"real")))
        );
    }
}
