//! Main sync engine that orchestrates the synchronization process

use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, info, info_span, Instrument};

use crate::comparator::NodeComparator;
use crate::diff::{DiffEntry, MergeDiff};
use crate::error::{Result, SyncError};
use crate::executor::{Removal, TransferExecutor};
use crate::filter::ExcludeFilter;
use crate::location::Location;
use crate::metrics::{SyncMetrics, SyncOutcome, TransferDirection};
use crate::node::Node;
use crate::preservation::PreservationOptions;
use crate::progress::{FileOperation, ProgressReporter};
use crate::session::SyncSession;
use crate::walker::{walker_for, WalkOptions};

/// Options for sync operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Descend into directories and sub-prefixes
    pub recursive: bool,
    /// Remove destination entries that do not exist in the source
    pub delete: bool,
    /// Never remove anything; overrides `delete`
    pub keep: bool,
    /// Report what would happen without touching either side
    pub dry_run: bool,
    /// Log every create, update and remove
    pub verbose: bool,
    /// Emit transfer progress while moving bytes
    pub progress: bool,
    /// Regular expression matched against relative names
    pub exclude: Option<String>,
    /// Create missing parent directories when downloading
    pub make_dirs: bool,
    /// Compare by size and timestamp instead of content hashes
    pub no_fingerprint: bool,
    /// Upload with a public-read ACL
    pub public_read: bool,
    pub cache_control: Option<String>,
    pub expires: Option<String>,
    /// Metadata applied to downloaded files
    pub preservation: PreservationOptions,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            delete: true,
            keep: false,
            dry_run: false,
            verbose: false,
            progress: false,
            exclude: None,
            make_dirs: false,
            no_fingerprint: false,
            public_read: false,
            cache_control: None,
            expires: None,
            preservation: PreservationOptions::default(),
        }
    }
}

impl SyncOptions {
    pub fn removes_extraneous(&self) -> bool {
        self.delete && !self.keep
    }

    /// A dry run always echoes what it would do
    pub fn is_verbose(&self) -> bool {
        self.verbose || self.dry_run
    }
}

/// Result of one applied operation
struct Settled {
    operation: FileOperation,
    name: String,
    result: Result<u64>,
    duration: Duration,
}

/// Main sync engine
pub struct SyncEngine {
    session: SyncSession,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(session: SyncSession, options: SyncOptions) -> Self {
        Self { session, options }
    }

    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Make `destination` mirror `source`
    pub async fn sync(&self, source: &Location, destination: &Location) -> Result<SyncMetrics> {
        self.sync_with_progress(source, destination, None).await
    }

    /// Perform synchronization with progress reporting.
    ///
    /// Configuration problems are reported before anything is listed. An
    /// error that stops the run midway comes back as
    /// [`SyncError::Incomplete`] with the counts of what was already applied.
    pub async fn sync_with_progress(
        &self,
        source: &Location,
        destination: &Location,
        progress_reporter: Option<ProgressReporter>,
    ) -> Result<SyncMetrics> {
        match (source.is_remote(), destination.is_remote()) {
            (true, true) => return Err(SyncError::config_error("Both arguments can't be on S3")),
            (false, false) => return Err(SyncError::config_error("One argument must be on S3")),
            _ => {}
        }

        let filter = ExcludeFilter::new(self.options.exclude.as_deref())?;

        if source.is_local() {
            let root = source.local_root();
            fs::symlink_metadata(&root).await.map_err(|e| {
                SyncError::path_error(&root, format!("Source does not exist: {}", e))
            })?;
        }

        let span = info_span!(
            "sync",
            session_id = %self.session.id(),
            source = %source,
            destination = %destination,
            exclude = filter.pattern().unwrap_or("")
        );
        self.run(source, destination, filter, progress_reporter)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        source: &Location,
        destination: &Location,
        filter: ExcludeFilter,
        progress_reporter: Option<ProgressReporter>,
    ) -> Result<SyncMetrics> {
        let direction = if source.is_local() {
            TransferDirection::Upload
        } else {
            TransferDirection::Download
        };
        let mut metrics = SyncMetrics::new(self.session.id(), direction, self.options.dry_run);

        info!("Starting sync from '{}' to '{}'", source, destination);
        if let Some(reporter) = &progress_reporter {
            notify(reporter.sync_started(source.to_string(), destination.to_string(), self.options.dry_run));
            if self.options.dry_run {
                notify(reporter.info("Dry run: neither side will be modified"));
            }
        }

        let walk = WalkOptions {
            recursive: self.options.recursive,
            fingerprinting: !self.options.no_fingerprint,
        };
        let merge = MergeDiff::new(
            walker_for(source, &self.session, filter.clone(), walk),
            walker_for(destination, &self.session, filter, walk),
            NodeComparator::new(!self.options.no_fingerprint),
        );
        let executor = TransferExecutor::new(&self.session, destination, &self.options, progress_reporter.clone());

        let result = self
            .apply(merge, &executor, &progress_reporter, &mut metrics)
            .await;
        let retries_used = self.session.retry_budget().used();

        match result {
            Ok(()) => {
                metrics.complete(SyncOutcome::Completed, retries_used);
                info!("{}", metrics.summary());
                if let Some(reporter) = &progress_reporter {
                    notify(reporter.sync_completed().await);
                }
                Ok(metrics)
            }
            Err(cause) => {
                let outcome = match &cause {
                    SyncError::RetryBudgetExhausted { .. } => SyncOutcome::RetryBudgetExhausted,
                    SyncError::Cancelled => SyncOutcome::Cancelled,
                    _ => SyncOutcome::Aborted,
                };
                metrics.abort(outcome, retries_used, cause.to_string());
                if let Some(reporter) = &progress_reporter {
                    notify(reporter.sync_failed(cause.to_string()).await);
                }
                Err(SyncError::Incomplete {
                    cause: Box::new(cause),
                    metrics: Box::new(metrics),
                })
            }
        }
    }

    /// Drive the merge and apply each entry. Leaf transfers run on a bounded
    /// pool; markers and removals run in merge order. The pool is drained
    /// before a directory is removed, and a file that replaces a local
    /// directory is fetched only once everything else has settled.
    async fn apply<S, D>(
        &self,
        mut merge: MergeDiff<S, D>,
        executor: &TransferExecutor<'_>,
        progress_reporter: &Option<ProgressReporter>,
        metrics: &mut SyncMetrics,
    ) -> Result<()>
    where
        S: crate::walker::NodeWalker,
        D: crate::walker::NodeWalker,
    {
        let limit = self.session.config().max_concurrency;
        let mut in_flight: FuturesUnordered<BoxFuture<'_, Settled>> = FuturesUnordered::new();
        let mut replacements = Vec::new();

        loop {
            while in_flight.len() >= limit {
                if let Some(settled) = in_flight.next().await {
                    self.settle(settled, progress_reporter, metrics).await?;
                }
            }

            let Some(entry) = merge.next_entry().await? else {
                break;
            };

            match entry {
                DiffEntry::Unchanged { source, .. } => {
                    debug!("unchanged {}", source.name());
                    metrics.record_operation(FileOperation::Unchanged, 0);
                }
                DiffEntry::Create(source) => {
                    if let Some(task) = self.plan(FileOperation::Create, source, executor, progress_reporter, metrics) {
                        self.dispatch(task, &mut in_flight, progress_reporter, metrics).await?;
                    }
                }
                DiffEntry::Update {
                    source,
                    destination,
                    reason,
                } => {
                    debug!("{} differs: {:?}", source.name(), reason);
                    let replaces_directory = destination.is_local()
                        && destination.is_directory_marker()
                        && !source.is_directory_marker();
                    if let Some(task) = self.plan(FileOperation::Update, source, executor, progress_reporter, metrics) {
                        if replaces_directory {
                            replacements.push(task.future);
                        } else {
                            self.dispatch(task, &mut in_flight, progress_reporter, metrics).await?;
                        }
                    }
                }
                DiffEntry::Remove(node) => {
                    if node.is_directory_marker() {
                        self.drain(&mut in_flight, progress_reporter, metrics).await?;
                    }
                    self.remove(node, executor, progress_reporter, metrics).await?;
                }
            }
        }

        self.drain(&mut in_flight, progress_reporter, metrics).await?;
        for replacement in replacements {
            let settled = replacement.await;
            self.settle(settled, progress_reporter, metrics).await?;
        }
        Ok(())
    }

    /// Wait for every pooled transfer
    async fn drain(
        &self,
        in_flight: &mut FuturesUnordered<BoxFuture<'_, Settled>>,
        progress_reporter: &Option<ProgressReporter>,
        metrics: &mut SyncMetrics,
    ) -> Result<()> {
        while let Some(settled) = in_flight.next().await {
            self.settle(settled, progress_reporter, metrics).await?;
        }
        Ok(())
    }

    /// Echo the action and, unless this is a dry run, hand back the transfer to perform
    fn plan<'e>(
        &self,
        operation: FileOperation,
        source: Node,
        executor: &'e TransferExecutor<'e>,
        progress_reporter: &Option<ProgressReporter>,
        metrics: &mut SyncMetrics,
    ) -> Option<Task<'e>> {
        self.echo(operation, source.name(), progress_reporter);

        if self.options.dry_run {
            metrics.record_operation(operation, source.size());
            return None;
        }

        let inline = source.is_directory_marker();
        let future = async move {
            let started = Instant::now();
            let result = executor.transfer(&source).await;
            Settled {
                operation,
                name: source.name().to_string(),
                result,
                duration: started.elapsed(),
            }
        }
        .boxed();
        Some(Task { inline, future })
    }

    /// Markers are applied before anything nested under them is pulled from the merge
    async fn dispatch<'e>(
        &self,
        task: Task<'e>,
        in_flight: &mut FuturesUnordered<BoxFuture<'e, Settled>>,
        progress_reporter: &Option<ProgressReporter>,
        metrics: &mut SyncMetrics,
    ) -> Result<()> {
        if task.inline {
            let settled = task.future.await;
            self.settle(settled, progress_reporter, metrics).await
        } else {
            in_flight.push(task.future);
            Ok(())
        }
    }

    async fn remove(
        &self,
        node: Node,
        executor: &TransferExecutor<'_>,
        progress_reporter: &Option<ProgressReporter>,
        metrics: &mut SyncMetrics,
    ) -> Result<()> {
        if !self.options.removes_extraneous() {
            debug!("keeping {}", node.name());
            metrics.record_kept();
            return Ok(());
        }

        self.echo(FileOperation::Remove, node.name(), progress_reporter);
        if self.options.dry_run {
            metrics.record_operation(FileOperation::Remove, 0);
            return Ok(());
        }

        let started = Instant::now();
        let result = match executor.remove(&node).await {
            Ok(Removal::Removed) => Ok(0),
            Ok(Removal::Skipped) => {
                metrics.record_kept();
                return Ok(());
            }
            Err(e) => Err(e),
        };

        let settled = Settled {
            operation: FileOperation::Remove,
            name: node.name().to_string(),
            result,
            duration: started.elapsed(),
        };
        self.settle(settled, progress_reporter, metrics).await
    }

    /// Count one finished operation. Per-item failures are recorded and the
    /// run goes on; fatal errors are handed back.
    async fn settle(
        &self,
        settled: Settled,
        progress_reporter: &Option<ProgressReporter>,
        metrics: &mut SyncMetrics,
    ) -> Result<()> {
        let Settled {
            operation,
            name,
            result,
            duration,
        } = settled;

        match result {
            Ok(bytes) => {
                metrics.record_operation(operation, bytes);
                if let Some(reporter) = progress_reporter {
                    notify(reporter.file_operation_completed(operation, name, bytes, duration).await);
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!("{} of {} failed: {}", operation, name, e);
                metrics.record_failure(&name, e.to_string());
                if let Some(reporter) = progress_reporter {
                    notify(reporter.file_operation_failed(operation, name, e.to_string()).await);
                }
                Ok(())
            }
        }
    }

    fn echo(&self, operation: FileOperation, name: &str, progress_reporter: &Option<ProgressReporter>) {
        if self.options.is_verbose() {
            info!("{} node {}", operation, name);
        }
        if let Some(reporter) = progress_reporter {
            notify(reporter.node_action(operation, name));
        }
    }
}

/// A transfer to run, either right away or on the pool
struct Task<'e> {
    inline: bool,
    future: BoxFuture<'e, Settled>,
}

/// A closed progress channel never fails the run
fn notify(result: Result<()>) {
    if let Err(e) = result {
        debug!("progress event dropped: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::progress::{ProgressChannel, ProgressEvent};
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine(store: &MemoryStore, options: SyncOptions) -> SyncEngine {
        let config = SessionConfig {
            retry_delay_secs: 0,
            ..Default::default()
        };
        let session = SyncSession::new(Arc::new(store.clone()), config).unwrap();
        SyncEngine::new(session, options)
    }

    #[test]
    fn test_option_defaults() {
        let options = SyncOptions::default();
        assert!(options.recursive);
        assert!(options.removes_extraneous());
        assert!(!options.is_verbose());

        let keep = SyncOptions {
            keep: true,
            ..Default::default()
        };
        assert!(!keep.removes_extraneous());

        let dry = SyncOptions {
            dry_run: true,
            ..Default::default()
        };
        assert!(dry.is_verbose());
    }

    #[tokio::test]
    async fn test_endpoints_must_differ_in_kind() {
        let store = MemoryStore::with_bucket("b");
        let engine = engine(&store, SyncOptions::default());

        let both = engine
            .sync(&Location::remote("b", "x"), &Location::remote("b", "y"))
            .await;
        assert!(matches!(both, Err(SyncError::Configuration(m)) if m.contains("Both")));

        let neither = engine
            .sync(&Location::local("/x"), &Location::local("/y"))
            .await;
        assert!(matches!(neither, Err(SyncError::Configuration(m)) if m.contains("One argument")));
        assert_eq!(store.stats().network_calls(), 0);
    }

    #[tokio::test]
    async fn test_bad_exclude_pattern_is_reported_first() {
        let temp_dir = TempDir::new().unwrap();
        let store = MemoryStore::with_bucket("b");
        let engine = engine(
            &store,
            SyncOptions {
                exclude: Some("([".to_string()),
                ..Default::default()
            },
        );

        let source = Location::local(format!("{}/", temp_dir.path().display()));
        let result = engine.sync(&source, &Location::remote("b", "dst")).await;
        assert!(matches!(result, Err(SyncError::FilterPattern(_))));
        assert_eq!(store.stats().network_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_local_source_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = MemoryStore::with_bucket("b");
        let engine = engine(&store, SyncOptions::default());

        let source = Location::local(temp_dir.path().join("absent").to_string_lossy().into_owned());
        let result = engine.sync(&source, &Location::remote("b", "dst")).await;
        assert!(matches!(result, Err(SyncError::Path { .. })));
    }

    #[tokio::test]
    async fn test_progress_events_follow_the_run() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.txt"), b"aaa").await.unwrap();

        let store = MemoryStore::with_bucket("b");
        let engine = engine(&store, SyncOptions::default());
        let (reporter, mut channel) = ProgressChannel::new(engine.session().id());

        let source = Location::local(format!("{}/", temp_dir.path().display()));
        let metrics = engine
            .sync_with_progress(&source, &Location::remote("b", "dst"), Some(reporter))
            .await
            .unwrap();
        assert_eq!(metrics.files.created, 1);

        let mut kinds = Vec::new();
        while let Ok(event) = channel.try_recv() {
            kinds.push(match event {
                ProgressEvent::SyncStarted { .. } => "started",
                ProgressEvent::NodeAction { .. } => "action",
                ProgressEvent::FileOperationCompleted { .. } => "completed",
                ProgressEvent::SyncCompleted { .. } => "finished",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["started", "action", "completed", "finished"]);
    }

    #[tokio::test]
    async fn test_dry_run_announces_itself_and_transfers_nothing() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.txt"), b"aaa").await.unwrap();

        let store = MemoryStore::with_bucket("b");
        let engine = engine(
            &store,
            SyncOptions {
                dry_run: true,
                ..Default::default()
            },
        );
        let (reporter, mut channel) = ProgressChannel::new(engine.session().id());

        let source = Location::local(format!("{}/", temp_dir.path().display()));
        let metrics = engine
            .sync_with_progress(&source, &Location::remote("b", "dst"), Some(reporter))
            .await
            .unwrap();
        assert_eq!(metrics.files.created, 1);
        assert_eq!(metrics.transfer.bytes_uploaded, 3);
        assert_eq!(store.stats().mutations(), 0);

        let mut saw_info = false;
        while let Ok(event) = channel.try_recv() {
            assert!(!matches!(event, ProgressEvent::FileOperationCompleted { .. }));
            saw_info |= matches!(event, ProgressEvent::Info { .. });
        }
        assert!(saw_info);
    }
}
