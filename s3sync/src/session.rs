//! State shared by every component of one sync run

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{Result, SyncError};
use crate::retry::{RetryBudget, RetryController};
use crate::store::{RemoteStore, StoreConnection, StoreResult};

/// One run's retry budget, connection cache and cancellation signal.
///
/// Walkers, nodes and the executor all borrow the same session, so the
/// budget is a single counter no matter how many transfers are in flight.
pub struct SyncSession {
    id: Uuid,
    config: SessionConfig,
    retry: RetryController,
    cancel: CancellationToken,
}

impl SyncSession {
    pub fn new(store: Arc<dyn RemoteStore>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let retry = RetryController::new(store, config.retries, config.retry_delay());
        Ok(Self {
            id: Uuid::new_v4(),
            config,
            retry,
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn retry_budget(&self) -> &RetryBudget {
        self.retry.budget()
    }

    /// Token other tasks can use to stop this run
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Checked between items by walkers and the executor
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Issue a remote call through the retry controller; cancellation also
    /// interrupts a pending backoff sleep.
    pub async fn call<T, F, Fut>(&self, bucket: &str, operation: &str, key: &str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn StoreConnection>) -> Fut + Sync,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            result = self.retry.call(bucket, operation, key, f) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_cancelled_session_refuses_calls() {
        let store = MemoryStore::with_bucket("b");
        let session = SyncSession::new(Arc::new(store.clone()), SessionConfig::default()).unwrap();

        session.cancel();
        assert!(matches!(session.check_cancelled(), Err(SyncError::Cancelled)));

        let result = session
            .call("b", "head", "k", |conn| async move { conn.head("k").await })
            .await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(store.stats().network_calls(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = SessionConfig {
            max_concurrency: 0,
            ..Default::default()
        };
        let result = SyncSession::new(Arc::new(MemoryStore::new()), config);
        assert!(matches!(result, Err(SyncError::Configuration(_))));
    }
}
