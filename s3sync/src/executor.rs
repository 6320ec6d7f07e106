//! Applies diff entries: uploads, downloads and removals

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures::{stream, StreamExt};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::location::Location;
use crate::node::{LocalKind, LocalNode, Node, RemoteNode, DIRECTORY_MARKER_PAYLOAD};
use crate::preservation::{AttributePreserver, NodeMetadata};
use crate::progress::ProgressReporter;
use crate::progress_stream::ProgressStream;
use crate::session::SyncSession;
use crate::store::{ByteStream, PutObject, StoreError};
use crate::sync_engine::SyncOptions;

const PARTIAL_SUFFIX: &str = ".s3sync.tmp";

/// What a removal did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// Left in place, e.g. a local directory that still has entries
    Skipped,
}

/// Moves content from the source namespace to the destination.
///
/// Source nodes decide the direction: a local node is uploaded, a remote
/// node is downloaded. Every remote call goes through the session, so the
/// retry budget and cancellation apply to transfers as well.
pub struct TransferExecutor<'a> {
    session: &'a SyncSession,
    destination: &'a Location,
    options: &'a SyncOptions,
    preserver: AttributePreserver,
    reporter: Option<ProgressReporter>,
}

impl<'a> TransferExecutor<'a> {
    pub fn new(
        session: &'a SyncSession,
        destination: &'a Location,
        options: &'a SyncOptions,
        reporter: Option<ProgressReporter>,
    ) -> Self {
        Self {
            session,
            destination,
            options,
            preserver: AttributePreserver::new(options.preservation.clone()),
            reporter,
        }
    }

    fn progress_interval(&self) -> Duration {
        self.session.config().progress_interval()
    }

    /// Reporter handed to byte-counting streams, only when progress output is on
    fn stream_reporter(&self) -> Option<ProgressReporter> {
        if self.options.progress {
            self.reporter.clone()
        } else {
            None
        }
    }

    /// Create or replace the destination copy of `source`. Returns bytes moved.
    pub async fn transfer(&self, source: &Node) -> Result<u64> {
        self.session.check_cancelled()?;
        match source {
            Node::Local(local) => self.upload(local).await,
            Node::Remote(remote) => self.download(remote).await,
        }
    }

    /// Remove a destination-only node
    pub async fn remove(&self, destination: &Node) -> Result<Removal> {
        self.session.check_cancelled()?;
        match destination {
            Node::Remote(remote) => {
                self.session
                    .call(remote.bucket(), "delete", remote.key(), |conn| async move {
                        conn.delete(remote.key()).await
                    })
                    .await?;
                Ok(Removal::Removed)
            }
            Node::Local(local) => self.remove_local(local).await,
        }
    }

    async fn upload(&self, local: &LocalNode) -> Result<u64> {
        let bucket = self
            .destination
            .bucket
            .as_deref()
            .ok_or_else(|| SyncError::config_error("upload destination is not remote"))?;
        let key = self.destination.key_for(local.name());
        let metadata = local.metadata().to_headers();
        let headers = self.upload_headers();
        let size = local.size();

        debug!("uploading {} to {}:{}", local.path().display(), bucket, key);

        self.session
            .call(bucket, "put", &key, |conn| {
                let key = key.clone();
                let object_metadata = metadata.clone();
                let headers = headers.clone();
                async move {
                    let body = self.upload_body(local, size).await?;
                    conn.put(
                        &key,
                        PutObject {
                            body,
                            content_length: size,
                            metadata: object_metadata,
                            headers,
                        },
                    )
                    .await
                }
            })
            .await?;

        Ok(size)
    }

    /// Fresh body for one attempt; a file is reopened every time
    async fn upload_body(&self, local: &LocalNode, size: u64) -> std::result::Result<ByteStream, StoreError> {
        let fixed = |data: Bytes| -> ByteStream { stream::once(async move { Ok(data) }).boxed() };

        match local.kind() {
            LocalKind::Directory => Ok(fixed(Bytes::from_static(DIRECTORY_MARKER_PAYLOAD.as_bytes()))),
            LocalKind::Symlink { target } => Ok(fixed(Bytes::from(target.clone().into_bytes()))),
            LocalKind::File => {
                let file = File::open(local.path()).await?;
                let counted = ProgressStream::new(file, local.name(), size, self.progress_interval())
                    .with_reporter(self.stream_reporter());
                Ok(ReaderStream::new(counted).boxed())
            }
        }
    }

    fn upload_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if self.options.public_read {
            headers.push(("x-amz-acl".to_string(), "public-read".to_string()));
        }
        if let Some(cache_control) = &self.options.cache_control {
            headers.push(("Cache-Control".to_string(), cache_control.clone()));
        }
        if let Some(expires) = &self.options.expires {
            headers.push(("Expires".to_string(), expires.clone()));
        }
        headers
    }

    async fn download(&self, remote: &RemoteNode) -> Result<u64> {
        let path = self.destination.path_for(remote.name());

        if self.options.make_dirs {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    SyncError::path_error(parent, format!("Failed to create parent directory: {}", e))
                })?;
            }
        }

        if remote.is_directory_marker() {
            let metadata = remote.metadata(self.session).await?;
            self.make_directory(&path).await?;
            self.preserve(&path, &metadata).await;
            return Ok(0);
        }

        let mut partial = PartialDownload::new(&path);
        let fetched = self
            .session
            .call(remote.bucket(), "get", remote.key(), |conn| {
                let partial_path = partial.path.clone();
                async move {
                    let object = conn.get(remote.key()).await?;
                    let metadata = NodeMetadata::from_headers(&object.metadata.user);
                    if metadata.symlink {
                        let target = read_to_string(object.body).await?;
                        return Ok(Fetched::Symlink { metadata, target });
                    }

                    let file = File::create(&partial_path).await?;
                    let mut writer =
                        ProgressStream::new(file, remote.name(), object.metadata.size, self.progress_interval())
                            .with_reporter(self.stream_reporter());
                    let mut body = object.body;
                    while let Some(chunk) = body.next().await {
                        let chunk = chunk.map_err(StoreError::from_network_io)?;
                        writer.write_all(&chunk).await?;
                    }
                    writer.shutdown().await?;
                    Ok(Fetched::File {
                        metadata,
                        bytes: writer.transferred(),
                    })
                }
            })
            .await?;

        self.session.check_cancelled()?;

        let (metadata, bytes) = match fetched {
            Fetched::Symlink { metadata, target } => {
                self.clear_directory(remote.name(), &path).await?;
                self.clear_leaf(&path).await?;
                make_symlink(&target, &path).await?;
                (metadata, target.len() as u64)
            }
            Fetched::File { metadata, bytes } => {
                self.clear_directory(remote.name(), &path).await?;
                fs::rename(&partial.path, &path).await.map_err(|e| {
                    SyncError::transfer_error(remote.key(), path.display(), format!("Failed to move download into place: {}", e))
                })?;
                (metadata, bytes)
            }
        };
        partial.disarm();

        remote.remember_metadata(metadata);
        self.preserve(&path, &metadata).await;
        Ok(bytes)
    }

    async fn make_directory(&self, path: &Path) -> Result<()> {
        match fs::symlink_metadata(path).await {
            Ok(existing) if existing.is_dir() => return Ok(()),
            Ok(_) => self.clear_leaf(path).await?,
            Err(_) => {}
        }
        fs::create_dir(path)
            .await
            .map_err(|e| SyncError::path_error(path, format!("Failed to create directory: {}", e)))
    }

    /// Drop an emptied directory that a downloaded file replaces. Never the root.
    async fn clear_directory(&self, name: &str, path: &Path) -> Result<()> {
        match fs::symlink_metadata(path).await {
            Ok(existing) if existing.is_dir() => {
                if name.is_empty() {
                    return Err(SyncError::path_error(path, "Destination root is a directory"));
                }
                debug!("replacing directory {} with a file", path.display());
                fs::remove_dir(path)
                    .await
                    .map_err(|e| SyncError::deletion_error(path, format!("Failed to replace directory: {}", e)))
            }
            _ => Ok(()),
        }
    }

    /// Drop a file or link that is about to be replaced by another kind of node
    async fn clear_leaf(&self, path: &Path) -> Result<()> {
        match fs::symlink_metadata(path).await {
            Ok(existing) if !existing.is_dir() => fs::remove_file(path)
                .await
                .map_err(|e| SyncError::deletion_error(path, format!("Failed to replace: {}", e))),
            _ => Ok(()),
        }
    }

    async fn preserve(&self, path: &Path, metadata: &NodeMetadata) {
        if let Err(e) = self.preserver.apply(path, metadata).await {
            warn!("{}", e);
            if let Some(reporter) = &self.reporter {
                let _ = reporter.warning(e.to_string(), Some(path.display().to_string()));
            }
        }
    }

    async fn remove_local(&self, local: &LocalNode) -> Result<Removal> {
        let path = local.path();
        if local.name().is_empty() {
            warn!("refusing to remove the destination root {}", path.display());
            return Ok(Removal::Skipped);
        }

        if local.is_directory_marker() {
            let mut entries = fs::read_dir(path)
                .await
                .map_err(|e| SyncError::deletion_error(path, format!("Failed to read directory: {}", e)))?;
            if entries.next_entry().await?.is_some() {
                warn!("not removing non-empty directory {}", path.display());
                return Ok(Removal::Skipped);
            }
            fs::remove_dir(path)
                .await
                .map_err(|e| SyncError::deletion_error(path, format!("Failed to delete directory: {}", e)))?;
        } else {
            fs::remove_file(path)
                .await
                .map_err(|e| SyncError::deletion_error(path, format!("Failed to delete file: {}", e)))?;
        }
        Ok(Removal::Removed)
    }
}

enum Fetched {
    File { metadata: NodeMetadata, bytes: u64 },
    Symlink { metadata: NodeMetadata, target: String },
}

async fn read_to_string(mut body: ByteStream) -> std::result::Result<String, StoreError> {
    let mut data = Vec::new();
    while let Some(chunk) = body.next().await {
        data.extend_from_slice(&chunk.map_err(StoreError::from_network_io)?);
    }
    String::from_utf8(data).map_err(|e| StoreError::Other(format!("symlink target is not UTF-8: {}", e)))
}

#[cfg(unix)]
async fn make_symlink(target: &str, path: &Path) -> Result<()> {
    fs::symlink(target, path)
        .await
        .map_err(|e| SyncError::path_error(path, format!("Failed to create symlink: {}", e)))
}

#[cfg(not(unix))]
async fn make_symlink(target: &str, path: &Path) -> Result<()> {
    Err(SyncError::path_error(
        path,
        format!("symlinks are not supported here (target {})", target),
    ))
}

/// Temporary download target, removed unless the download was moved into place
struct PartialDownload {
    path: PathBuf,
    armed: bool,
}

impl PartialDownload {
    fn new(destination: &Path) -> Self {
        let mut name = destination.as_os_str().to_owned();
        name.push(PARTIAL_SUFFIX);
        Self {
            path: PathBuf::from(name),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialDownload {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("could not remove partial download {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::node::DIRECTORY_MARKER_TAG;
    use crate::preservation::PreservationOptions;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn session(store: &MemoryStore) -> SyncSession {
        let config = SessionConfig {
            retry_delay_secs: 0,
            ..Default::default()
        };
        SyncSession::new(Arc::new(store.clone()), config).unwrap()
    }

    fn options() -> SyncOptions {
        SyncOptions {
            preservation: PreservationOptions {
                preserve_permissions: true,
                preserve_ownership: false,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upload_file_with_headers() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("x.txt");
        fs::write(&path, b"hello").await.unwrap();

        let store = MemoryStore::with_bucket("b");
        let session = session(&store);
        let destination = Location::remote("b", "dst");
        let options = SyncOptions {
            public_read: true,
            cache_control: Some("max-age=60".to_string()),
            ..options()
        };
        let executor = TransferExecutor::new(&session, &destination, &options, None);

        let node = Node::Local(LocalNode::from_path(&path, "x.txt", true).await.unwrap().unwrap());
        assert_eq!(executor.transfer(&node).await.unwrap(), 5);

        let object = store.object("b", "dst/x.txt").unwrap();
        assert_eq!(&object.data[..], b"hello");
        assert_eq!(object.etag, "\"5d41402abc4b2a76b9719d911017c592\"");
        assert!(object.metadata.contains_key("permissions"));
        assert!(object
            .headers
            .contains(&("x-amz-acl".to_string(), "public-read".to_string())));
        assert!(object
            .headers
            .contains(&("Cache-Control".to_string(), "max-age=60".to_string())));
    }

    #[tokio::test]
    async fn test_upload_directory_writes_marker() {
        let temp_dir = TempDir::new().unwrap();
        let store = MemoryStore::with_bucket("b");
        let session = session(&store);
        let destination = Location::remote("b", "dst");
        let options = options();
        let executor = TransferExecutor::new(&session, &destination, &options, None);

        let node = Node::Local(LocalNode::from_path(temp_dir.path(), "d", true).await.unwrap().unwrap());
        executor.transfer(&node).await.unwrap();

        let object = store.object("b", "dst/d").unwrap();
        assert_eq!(&object.data[..], DIRECTORY_MARKER_PAYLOAD.as_bytes());
        assert_eq!(object.etag, format!("\"{}\"", DIRECTORY_MARKER_TAG));
    }

    #[tokio::test]
    async fn test_upload_retries_transient_failure() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("x.txt");
        fs::write(&path, b"hello").await.unwrap();

        let store = MemoryStore::with_bucket("b");
        store.fail_next(
            crate::store::StoreOperation::Put,
            [StoreError::status(503, "SlowDown")],
        );
        let session = session(&store);
        let destination = Location::remote("b", "");
        let options = options();
        let executor = TransferExecutor::new(&session, &destination, &options, None);

        let node = Node::Local(LocalNode::from_path(&path, "x.txt", true).await.unwrap().unwrap());
        executor.transfer(&node).await.unwrap();

        assert_eq!(&store.object("b", "x.txt").unwrap().data[..], b"hello");
        assert_eq!(session.retry_budget().used(), 1);
    }

    #[tokio::test]
    async fn test_download_file_applies_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let store = MemoryStore::with_bucket("b");
        let metadata = HashMap::from([("permissions".to_string(), "33188".to_string())]);
        store.insert("b", "src/a.txt", "content", metadata);

        let session = session(&store);
        let destination = Location::local(temp_dir.path().to_string_lossy().into_owned());
        let options = options();
        let executor = TransferExecutor::new(&session, &destination, &options, None);

        let remote = RemoteNode::new("b", "src/a.txt", "a.txt", 7, "x", Utc::now());
        let node = Node::Remote(remote);
        assert_eq!(executor.transfer(&node).await.unwrap(), 7);

        let path = temp_dir.path().join("a.txt");
        assert_eq!(fs::read_to_string(&path).await.unwrap(), "content");
        assert!(!temp_dir.path().join("a.txt.s3sync.tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).await.unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }

        // Metadata came with the GET, so no HEAD is needed
        assert_eq!(store.stats().heads, 0);
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = MemoryStore::with_bucket("b");
        let session = session(&store);
        let destination = Location::local(temp_dir.path().to_string_lossy().into_owned());
        let options = options();
        let executor = TransferExecutor::new(&session, &destination, &options, None);

        let node = Node::Remote(RemoteNode::new("b", "missing", "missing", 3, "x", Utc::now()));
        let err = executor.transfer(&node).await.unwrap_err();
        assert!(matches!(err, SyncError::Store { .. }));
        assert!(!temp_dir.path().join("missing").exists());
        assert!(!temp_dir.path().join("missing.s3sync.tmp").exists());
    }

    #[tokio::test]
    async fn test_download_without_parent_needs_make_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let store = MemoryStore::with_bucket("b");
        store.insert("b", "deep/a/b.txt", "x", HashMap::new());
        let session = session(&store);
        let destination = Location::local(temp_dir.path().to_string_lossy().into_owned());

        let plain = options();
        let executor = TransferExecutor::new(&session, &destination, &plain, None);
        let node = Node::Remote(RemoteNode::new("b", "deep/a/b.txt", "a/b.txt", 1, "x", Utc::now()));
        assert!(executor.transfer(&node).await.is_err());

        let with_dirs = SyncOptions {
            make_dirs: true,
            ..options()
        };
        let executor = TransferExecutor::new(&session, &destination, &with_dirs, None);
        executor.transfer(&node).await.unwrap();
        assert!(temp_dir.path().join("a/b.txt").exists());
    }

    #[tokio::test]
    async fn test_remove_local_keeps_non_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("d/inner")).await.unwrap();
        fs::write(temp_dir.path().join("f"), b"x").await.unwrap();

        let store = MemoryStore::new();
        let session = session(&store);
        let destination = Location::local(temp_dir.path().to_string_lossy().into_owned());
        let options = options();
        let executor = TransferExecutor::new(&session, &destination, &options, None);

        let node = |name: &str| {
            let path = temp_dir.path().join(name);
            let name = name.to_string();
            async move { Node::Local(LocalNode::from_path(path, name, false).await.unwrap().unwrap()) }
        };

        assert_eq!(executor.remove(&node("f").await).await.unwrap(), Removal::Removed);
        assert_eq!(executor.remove(&node("d").await).await.unwrap(), Removal::Skipped);
        assert_eq!(executor.remove(&node("d/inner").await).await.unwrap(), Removal::Removed);
        assert_eq!(executor.remove(&node("d").await).await.unwrap(), Removal::Removed);
        assert!(!temp_dir.path().join("d").exists());
        assert!(!temp_dir.path().join("f").exists());
    }

    #[tokio::test]
    async fn test_cancelled_session_transfers_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("x.txt");
        fs::write(&path, b"hello").await.unwrap();

        let store = MemoryStore::with_bucket("b");
        let session = session(&store);
        session.cancel();
        let destination = Location::remote("b", "");
        let options = options();
        let executor = TransferExecutor::new(&session, &destination, &options, None);

        let node = Node::Local(LocalNode::from_path(&path, "x.txt", true).await.unwrap().unwrap());
        assert!(matches!(executor.transfer(&node).await, Err(SyncError::Cancelled)));
        assert_eq!(store.stats().network_calls(), 0);
    }
}
