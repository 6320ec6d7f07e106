//! Session-wide settings supplied by the embedding application

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Settings that shape how a [`crate::SyncSession`] talks to the remote store.
///
/// The engine never loads these itself; callers build the value or
/// deserialize it from whatever source they use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Transient failures tolerated across the whole run
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Pause after each transient failure
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// `max-keys` for each listing page
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Transfers allowed in flight at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Minimum gap between two progress reports for one transfer
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            page_size: default_page_size(),
            max_concurrency: default_max_concurrency(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(SyncError::config_error("page_size must be at least 1"));
        }
        if self.max_concurrency == 0 {
            return Err(SyncError::config_error("max_concurrency must be at least 1"));
        }
        if self.progress_interval_ms == 0 {
            return Err(SyncError::config_error(
                "progress_interval_ms must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

fn default_retries() -> u32 { 100 }
fn default_retry_delay_secs() -> u64 { 30 }
fn default_page_size() -> u32 { 200 }
fn default_max_concurrency() -> usize { 4 }
fn default_progress_interval_ms() -> u64 { 1000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: SessionConfig = serde_json::from_str(r#"{"retries": 5}"#).unwrap();
        assert_eq!(config.retries, 5);
        assert_eq!(config.retry_delay(), Duration::from_secs(30));
        assert_eq!(config.page_size, 200);
        assert_eq!(config.max_concurrency, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_page_size_is_rejected() {
        let config = SessionConfig {
            page_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Configuration(_))));
    }
}
