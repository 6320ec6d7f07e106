//! Progress reporting for sync runs

use std::sync::Arc;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Progress event types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProgressEvent {
    /// Sync run started
    SyncStarted {
        session_id: Uuid,
        source: String,
        destination: String,
        dry_run: bool,
    },
    /// An action was decided for a node (the verbose echo)
    NodeAction {
        operation: FileOperation,
        name: String,
    },
    /// Bytes moved so far for one transfer
    TransferProgress {
        name: String,
        bytes_transferred: u64,
        bytes_total: u64,
        bytes_per_second: f64,
    },
    /// File operation completed
    FileOperationCompleted {
        operation: FileOperation,
        name: String,
        bytes: u64,
        duration: Duration,
    },
    /// File operation failed
    FileOperationFailed {
        operation: FileOperation,
        name: String,
        error: String,
    },
    /// Sync run completed
    SyncCompleted {
        session_id: Uuid,
        files_processed: usize,
        bytes_processed: u64,
        duration: Duration,
        errors: Vec<String>,
    },
    /// Sync run stopped early
    SyncFailed {
        session_id: Uuid,
        error: String,
        files_processed: usize,
        bytes_processed: u64,
        duration: Duration,
    },
    /// Warning message
    Warning {
        message: String,
        name: Option<String>,
    },
    /// Info message
    Info {
        message: String,
    },
}

/// File operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileOperation {
    Create,
    Update,
    Remove,
    Unchanged,
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileOperation::Create => write!(f, "Create"),
            FileOperation::Update => write!(f, "Update"),
            FileOperation::Remove => write!(f, "Remove"),
            FileOperation::Unchanged => write!(f, "Unchanged"),
        }
    }
}

/// Progress channel for receiving progress updates
pub struct ProgressChannel {
    receiver: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressChannel {
    /// Create a reporter for `session_id` and the channel it feeds
    pub fn new(session_id: Uuid) -> (ProgressReporter, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let reporter = ProgressReporter::new(sender, session_id);
        let channel = Self { receiver };
        (reporter, channel)
    }

    /// Receive the next progress event
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    /// Try to receive a progress event without blocking
    pub fn try_recv(&mut self) -> Result<ProgressEvent> {
        self.receiver.try_recv().map_err(|e| match e {
            mpsc::error::TryRecvError::Empty => SyncError::Progress("No progress events available".to_string()),
            mpsc::error::TryRecvError::Disconnected => SyncError::Progress("Progress channel disconnected".to_string()),
        })
    }

    /// Close the channel
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Progress reporter for sending progress updates
#[derive(Clone)]
pub struct ProgressReporter {
    sender: mpsc::UnboundedSender<ProgressEvent>,
    session_id: Uuid,
    start_time: Instant,
    state: Arc<RwLock<ProgressState>>,
}

#[derive(Debug, Default)]
struct ProgressState {
    files_processed: usize,
    bytes_processed: u64,
    errors: Vec<String>,
}

impl ProgressReporter {
    fn new(sender: mpsc::UnboundedSender<ProgressEvent>, session_id: Uuid) -> Self {
        Self {
            sender,
            session_id,
            start_time: Instant::now(),
            state: Arc::new(RwLock::new(ProgressState::default())),
        }
    }

    /// Report sync started
    pub fn sync_started(&self, source: impl Into<String>, destination: impl Into<String>, dry_run: bool) -> Result<()> {
        self.send(ProgressEvent::SyncStarted {
            session_id: self.session_id,
            source: source.into(),
            destination: destination.into(),
            dry_run,
        })
    }

    /// Report the action chosen for a node
    pub fn node_action(&self, operation: FileOperation, name: impl Into<String>) -> Result<()> {
        self.send(ProgressEvent::NodeAction {
            operation,
            name: name.into(),
        })
    }

    /// Report bytes moved for one transfer; callable from poll functions
    pub fn transfer_progress(&self, name: &str, bytes_transferred: u64, bytes_total: u64, elapsed: Duration) -> Result<()> {
        let bytes_per_second = if elapsed.as_secs_f64() > 0.0 {
            bytes_transferred as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        self.send(ProgressEvent::TransferProgress {
            name: name.to_string(),
            bytes_transferred,
            bytes_total,
            bytes_per_second,
        })
    }

    /// Report file operation completed
    pub async fn file_operation_completed(
        &self,
        operation: FileOperation,
        name: impl Into<String>,
        bytes: u64,
        duration: Duration,
    ) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state.files_processed += 1;
            state.bytes_processed += bytes;
        }

        self.send(ProgressEvent::FileOperationCompleted {
            operation,
            name: name.into(),
            bytes,
            duration,
        })
    }

    /// Report file operation failed
    pub async fn file_operation_failed(
        &self,
        operation: FileOperation,
        name: impl Into<String>,
        error: impl Into<String>,
    ) -> Result<()> {
        let error_msg = error.into();

        {
            let mut state = self.state.write().await;
            state.files_processed += 1;
            state.errors.push(error_msg.clone());
        }

        self.send(ProgressEvent::FileOperationFailed {
            operation,
            name: name.into(),
            error: error_msg,
        })
    }

    /// Report sync completed
    pub async fn sync_completed(&self) -> Result<()> {
        let state = self.state.read().await;

        self.send(ProgressEvent::SyncCompleted {
            session_id: self.session_id,
            files_processed: state.files_processed,
            bytes_processed: state.bytes_processed,
            duration: self.start_time.elapsed(),
            errors: state.errors.clone(),
        })
    }

    /// Report sync failed
    pub async fn sync_failed(&self, error: impl Into<String>) -> Result<()> {
        let state = self.state.read().await;

        self.send(ProgressEvent::SyncFailed {
            session_id: self.session_id,
            error: error.into(),
            files_processed: state.files_processed,
            bytes_processed: state.bytes_processed,
            duration: self.start_time.elapsed(),
        })
    }

    /// Report warning
    pub fn warning(&self, message: impl Into<String>, name: Option<String>) -> Result<()> {
        self.send(ProgressEvent::Warning {
            message: message.into(),
            name,
        })
    }

    /// Report info
    pub fn info(&self, message: impl Into<String>) -> Result<()> {
        self.send(ProgressEvent::Info {
            message: message.into(),
        })
    }

    fn send(&self, event: ProgressEvent) -> Result<()> {
        self.sender.send(event).map_err(|_| {
            SyncError::Progress("Progress channel disconnected".to_string())
        })
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format bytes per second as human-readable string
pub fn format_bytes_per_second(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let session_id = Uuid::new_v4();
        let (reporter, mut channel) = ProgressChannel::new(session_id);

        reporter.sync_started("/src/", "bucket:dst", true).unwrap();
        reporter.node_action(FileOperation::Create, "x.txt").unwrap();

        match channel.recv().await.unwrap() {
            ProgressEvent::SyncStarted { session_id: id, dry_run, .. } => {
                assert_eq!(id, session_id);
                assert!(dry_run);
            }
            other => panic!("Expected SyncStarted event, got {:?}", other),
        }

        match channel.recv().await.unwrap() {
            ProgressEvent::NodeAction { operation, name } => {
                assert_eq!(operation, FileOperation::Create);
                assert_eq!(name, "x.txt");
            }
            other => panic!("Expected NodeAction event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_completion_totals() {
        let (reporter, mut channel) = ProgressChannel::new(Uuid::new_v4());

        reporter
            .file_operation_completed(FileOperation::Create, "a", 100, Duration::from_millis(5))
            .await
            .unwrap();
        reporter
            .file_operation_failed(FileOperation::Update, "b", "denied")
            .await
            .unwrap();
        reporter.sync_completed().await.unwrap();

        let _completed = channel.recv().await.unwrap();
        let _failed = channel.recv().await.unwrap();
        match channel.recv().await.unwrap() {
            ProgressEvent::SyncCompleted { files_processed, bytes_processed, errors, .. } => {
                assert_eq!(files_processed, 2);
                assert_eq!(bytes_processed, 100);
                assert_eq!(errors, vec!["denied".to_string()]);
            }
            other => panic!("Expected SyncCompleted event, got {:?}", other),
        }
    }

    #[test]
    fn test_transfer_rate() {
        let (reporter, mut channel) = ProgressChannel::new(Uuid::new_v4());
        reporter
            .transfer_progress("big", 500, 1000, Duration::from_secs(10))
            .unwrap();
        match channel.try_recv().unwrap() {
            ProgressEvent::TransferProgress { bytes_per_second, .. } => {
                assert_eq!(format_bytes_per_second(bytes_per_second), "50 B/s");
            }
            other => panic!("Expected TransferProgress event, got {:?}", other),
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }
}
