//! Configuration for the mining engine.

use crate::error::{MiningError, Result};
use serde::{Deserialize, Serialize};
use sift_core::config::{env_override_parse, env_override};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_WORKERS: &str = "SIFT_WORKERS";
pub const ENV_USER_AGENT: &str = "SIFT_USER_AGENT";
pub const ENV_CACHE_SNAPSHOT: &str = "SIFT_CACHE_SNAPSHOT";

/// `[mining]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    /// Number of concurrent workers
    pub workers: usize,

    /// Capacity of the worker -> aggregator event channel
    pub event_channel_capacity: usize,

    /// Freshness window applied when an attribute has no `ttl_ms`
    pub default_ttl_ms: u64,

    /// First retry delay; doubles on each further attempt
    pub retry_base_ms: u64,

    /// Upper bound for a single retry delay
    pub retry_max_ms: u64,

    /// How long an idle worker sleeps before polling the queue again
    pub idle_poll_ms: u64,

    /// User agent sent by the HTTP fetcher
    pub user_agent: String,

    /// Where the URL cache is persisted between runs
    pub cache_snapshot_path: Option<PathBuf>,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            event_channel_capacity: 256,
            default_ttl_ms: 24 * 60 * 60 * 1000,
            retry_base_ms: 500,
            retry_max_ms: 30_000,
            idle_poll_ms: 250,
            user_agent: concat!("sift/", env!("CARGO_PKG_VERSION")).to_string(),
            cache_snapshot_path: None,
        }
    }
}

impl MiningConfig {
    /// Apply `SIFT_*` environment overrides for this section.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(workers) = env_override_parse::<usize>(ENV_WORKERS)? {
            self.workers = workers;
        }
        if let Some(agent) = env_override(ENV_USER_AGENT) {
            self.user_agent = agent;
        }
        if let Some(path) = env_override(ENV_CACHE_SNAPSHOT) {
            self.cache_snapshot_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(MiningError::Config("workers must be at least 1".to_string()));
        }
        if self.event_channel_capacity == 0 {
            return Err(MiningError::Config(
                "event_channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.default_ttl_ms == 0 {
            return Err(MiningError::Config("default_ttl_ms must be positive".to_string()));
        }
        if self.retry_base_ms > self.retry_max_ms {
            return Err(MiningError::Config(
                "retry_base_ms must not exceed retry_max_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }

    /// Delay before retry number `attempt + 1` (exponential, capped).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(20);
        let delay = self.retry_base_ms.saturating_mul(factor).min(self.retry_max_ms);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MiningConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = MiningConfig {
            retry_base_ms: 100,
            retry_max_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(config.backoff_for(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(800));
        assert_eq!(config.backoff_for(4), Duration::from_millis(1_000));
        assert_eq!(config.backoff_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = MiningConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MiningError::Config(_))));
    }
}
