//! Retry policy wrapped around every remote store call
//!
//! All calls of a run draw from one [`RetryBudget`]. Each transient
//! failure (transport errors and 5xx answers) costs one unit and a fixed
//! pause; a 307 reconnects to the host it names and retries at once for
//! free; anything else fails the call without touching the budget.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::store::{RemoteStore, StoreConnection, StoreError, StoreResult};

/// Consecutive redirects tolerated within one call
const MAX_REDIRECTS: u32 = 10;

const PERMANENT_REDIRECT_HINT: &str =
    "Permanent redirect received. Try setting AWS_CALLING_FORMAT to SUBDOMAIN";

/// Run-wide count of transient failures still tolerated
#[derive(Debug)]
pub struct RetryBudget {
    initial: u32,
    remaining: AtomicU32,
}

impl RetryBudget {
    pub fn new(retries: u32) -> Self {
        Self {
            initial: retries,
            remaining: AtomicU32::new(retries),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }

    pub fn used(&self) -> u32 {
        self.initial - self.remaining()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Take one unit; false once nothing is left
    fn consume(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Fixed pause for as long as the shared budget lasts
struct BudgetBackoff<'a> {
    budget: &'a RetryBudget,
    delay: Duration,
}

impl Backoff for BudgetBackoff<'_> {
    fn next_backoff(&mut self) -> Option<Duration> {
        self.budget.consume().then_some(self.delay)
    }
}

struct CachedConnection {
    bucket: String,
    connection: Arc<dyn StoreConnection>,
}

/// Executes store calls against a cached per-bucket connection
pub struct RetryController {
    store: Arc<dyn RemoteStore>,
    budget: RetryBudget,
    delay: Duration,
    connection: Mutex<Option<CachedConnection>>,
}

impl RetryController {
    pub fn new(store: Arc<dyn RemoteStore>, retries: u32, delay: Duration) -> Self {
        Self {
            store,
            budget: RetryBudget::new(retries),
            delay,
            connection: Mutex::new(None),
        }
    }

    pub fn budget(&self) -> &RetryBudget {
        &self.budget
    }

    /// Run `f` against a connection to `bucket` until it succeeds, fails
    /// permanently, or the budget runs out. `f` is invoked once per attempt,
    /// so it must rebuild any request body it sends.
    pub async fn call<T, F, Fut>(&self, bucket: &str, operation: &str, key: &str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn StoreConnection>) -> Fut + Sync,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        let f = &f;
        let redirects = AtomicU32::new(0);
        let redirects = &redirects;

        let backoff = BudgetBackoff {
            budget: &self.budget,
            delay: self.delay,
        };

        let result = backoff::future::retry_notify(
            backoff,
            || async move {
                let outcome = match self.connection(bucket, None).await {
                    Ok(connection) => f(connection).await,
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(value) => Ok(value),
                    Err(e) => Err(self.classify(bucket, e, redirects).await),
                }
            },
            |err: StoreError, wait: Duration| {
                if err.status_code() != Some(307) {
                    warn!(
                        "{} of '{}' failed: {}. {} retries left, sleeping for {} seconds",
                        operation,
                        key,
                        err,
                        self.budget.remaining(),
                        wait.as_secs()
                    );
                }
            },
        )
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(e) if e.is_transient() => {
                error!("Ran out of retries; operations did not complete! Last error: {}", e);
                Err(SyncError::RetryBudgetExhausted {
                    operation: operation.to_string(),
                    key: key.to_string(),
                })
            }
            Err(e) => Err(SyncError::store_error(operation, key, e)),
        }
    }

    /// Decide how the failed attempt continues
    async fn classify(
        &self,
        bucket: &str,
        error: StoreError,
        redirects: &AtomicU32,
    ) -> backoff::Error<StoreError> {
        match error.status_code() {
            Some(307) => {
                let host = match &error {
                    StoreError::Status { location: Some(location), .. } => redirect_host(location),
                    _ => None,
                };
                let Some(host) = host else {
                    return backoff::Error::permanent(error);
                };
                if redirects.fetch_add(1, Ordering::SeqCst) >= MAX_REDIRECTS {
                    return backoff::Error::permanent(error);
                }
                info!("Temporary redirect for bucket {} to {}", bucket, host);
                match self.connection(bucket, Some(&host)).await {
                    Ok(_) => backoff::Error::retry_after(error, Duration::ZERO),
                    Err(e) if e.is_transient() => backoff::Error::transient(e),
                    Err(e) => backoff::Error::permanent(e),
                }
            }
            Some(301) => {
                warn!("{}", PERMANENT_REDIRECT_HINT);
                backoff::Error::permanent(error)
            }
            _ if error.is_transient() => {
                if error.breaks_connection() {
                    *self.connection.lock().await = None;
                }
                backoff::Error::transient(error)
            }
            _ => backoff::Error::permanent(error),
        }
    }

    /// Cached connection for `bucket`; a different bucket or an explicit host reconnects
    async fn connection(&self, bucket: &str, host: Option<&str>) -> StoreResult<Arc<dyn StoreConnection>> {
        let mut cached = self.connection.lock().await;
        if host.is_none() {
            if let Some(current) = cached.as_ref().filter(|c| c.bucket == bucket) {
                return Ok(Arc::clone(&current.connection));
            }
        }

        debug!("connecting to bucket {} (host: {:?})", bucket, host);
        *cached = None;
        let connection = self.store.connect(bucket, host).await?;
        *cached = Some(CachedConnection {
            bucket: bucket.to_string(),
            connection: Arc::clone(&connection),
        });
        Ok(connection)
    }
}

/// `host[:port]` of a redirect target
fn redirect_host(location: &str) -> Option<String> {
    let url = url::Url::parse(location).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}
