//! Run report: counts, bytes moved, retries used and how the run ended

use std::time::{Duration, SystemTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::progress::{format_bytes, FileOperation};
use tracing::{debug, error, info, warn};

/// Which way content flows for the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOutcome {
    /// Still running
    InProgress,
    /// Every entry was visited; individual items may still have failed
    Completed,
    RetryBudgetExhausted,
    Cancelled,
    /// A listing failed or another fatal error stopped the run
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub session_id: Uuid,
    pub direction: TransferDirection,
    pub dry_run: bool,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub duration: Duration,
    pub files: FileStats,
    pub transfer: TransferStats,
    pub errors: ErrorStats,
    /// Retry budget consumed by this run
    pub retries_used: u32,
    pub outcome: SyncOutcome,
}

/// Per-name counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// Destination-only entries left alone because deletion is off
    pub kept: usize,
}

impl FileStats {
    pub fn processed(&self) -> usize {
        self.created + self.updated + self.removed + self.unchanged + self.failed + self.kept
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

impl TransferStats {
    pub fn total(&self) -> u64 {
        self.bytes_uploaded + self.bytes_downloaded
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorStats {
    /// Per-item failures; the run went on
    pub recoverable_errors: Vec<String>,
    /// The error that stopped the run, if any
    pub critical_error: Option<String>,
}

impl SyncMetrics {
    pub fn new(session_id: Uuid, direction: TransferDirection, dry_run: bool) -> Self {
        Self {
            session_id,
            direction,
            dry_run,
            start_time: SystemTime::now(),
            end_time: None,
            duration: Duration::default(),
            files: FileStats::default(),
            transfer: TransferStats::default(),
            errors: ErrorStats::default(),
            retries_used: 0,
            outcome: SyncOutcome::InProgress,
        }
    }

    /// Count one applied (or, under dry-run, announced) operation
    pub fn record_operation(&mut self, operation: FileOperation, bytes: u64) {
        debug!(operation = %operation, bytes, "operation recorded");

        match operation {
            FileOperation::Create => self.files.created += 1,
            FileOperation::Update => self.files.updated += 1,
            FileOperation::Remove => self.files.removed += 1,
            FileOperation::Unchanged => self.files.unchanged += 1,
        }

        if matches!(operation, FileOperation::Create | FileOperation::Update) {
            match self.direction {
                TransferDirection::Upload => self.transfer.bytes_uploaded += bytes,
                TransferDirection::Download => self.transfer.bytes_downloaded += bytes,
            }
        }
    }

    pub fn record_kept(&mut self) {
        self.files.kept += 1;
    }

    /// Count a per-item failure
    pub fn record_failure(&mut self, name: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(name, message = %message, "Recoverable sync error occurred");
        self.files.failed += 1;
        self.errors.recoverable_errors.push(format!("{}: {}", name, message));
    }

    /// Close the report and log it
    pub fn complete(&mut self, outcome: SyncOutcome, retries_used: u32) {
        let end_time = SystemTime::now();
        self.end_time = Some(end_time);
        self.duration = end_time.duration_since(self.start_time).unwrap_or_default();
        self.outcome = outcome;
        self.retries_used = retries_used;

        info!(
            session_id = %self.session_id,
            duration_secs = self.duration.as_secs_f64(),
            created = self.files.created,
            updated = self.files.updated,
            removed = self.files.removed,
            unchanged = self.files.unchanged,
            failed = self.files.failed,
            kept = self.files.kept,
            bytes_uploaded = self.transfer.bytes_uploaded,
            bytes_downloaded = self.transfer.bytes_downloaded,
            retries_used = self.retries_used,
            outcome = ?self.outcome,
            "Sync operation completed"
        );
    }

    /// Close the report for a run stopped by `error`
    pub fn abort(&mut self, outcome: SyncOutcome, retries_used: u32, error: impl Into<String>) {
        let error = error.into();
        error!(session_id = %self.session_id, error = %error, "Critical sync error occurred");
        self.errors.critical_error = Some(error);
        self.complete(outcome, retries_used);
    }

    /// Percentage of processed names that did not fail
    pub fn success_rate(&self) -> f64 {
        let processed = self.files.processed();
        if processed == 0 {
            100.0
        } else {
            let successful = processed - self.files.failed;
            (successful as f64 / processed as f64) * 100.0
        }
    }

    pub fn is_successful(&self) -> bool {
        self.outcome == SyncOutcome::Completed && self.files.failed == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "Sync finished in {:.2}s: {} created, {} updated, {} removed, {} unchanged, {} failed, {} kept; {} transferred, {} retries used",
            self.duration.as_secs_f64(),
            self.files.created,
            self.files.updated,
            self.files.removed,
            self.files.unchanged,
            self.files.failed,
            self.files.kept,
            format_bytes(self.transfer.total()),
            self.retries_used,
        )
    }
}
