//! S3 Sync Engine Library
//!
//! One-way synchronization between a local directory tree and a key prefix
//! in an S3-compatible bucket:
//! - Lazy, ordered walks over both namespaces with regex exclusion
//! - A single-pass merge that classifies every name
//! - A run-wide retry budget around every remote call
//! - Uploads and downloads that carry ownership, permissions and symlinks
//! - Dry-run, keep and verbose modes, progress events and a run report

pub mod comparator;
pub mod config;
pub mod diff;
pub mod error;
pub mod executor;
pub mod filter;
pub mod location;
pub mod metrics;
pub mod node;
pub mod preservation;
pub mod progress;
pub mod progress_stream;
pub mod retry;
pub mod session;
pub mod store;
pub mod sync_engine;
pub mod walker;

use std::sync::Arc;

// Re-export main types and functions
pub use comparator::{ComparisonResult, NodeComparator};
pub use config::SessionConfig;
pub use diff::{cmp, DiffEntry, DiffResult, MergeDiff};
pub use error::{Result, SyncError};
pub use executor::TransferExecutor;
pub use filter::ExcludeFilter;
pub use location::{resolve_endpoints, Location};
pub use metrics::{FileStats, SyncMetrics, SyncOutcome};
pub use node::{LocalNode, Node, RemoteNode};
pub use preservation::{AttributePreserver, NodeMetadata, PreservationOptions};
pub use progress::{ProgressChannel, ProgressEvent, ProgressReporter};
pub use progress_stream::ProgressStream;
pub use retry::{RetryBudget, RetryController};
pub use session::SyncSession;
pub use store::{MemoryStore, RemoteStore, StoreConnection, StoreError};
pub use sync_engine::{SyncEngine, SyncOptions};
pub use walker::{LocalWalker, NodeWalker, RemoteWalker};

/// Make `destination` mirror `source` in one run against `store`
pub async fn sync(
    source: &Location,
    destination: &Location,
    store: Arc<dyn RemoteStore>,
    config: SessionConfig,
    options: SyncOptions,
) -> Result<SyncMetrics> {
    let session = SyncSession::new(store, config)?;
    let engine = SyncEngine::new(session, options);
    engine.sync(source, destination).await
}
