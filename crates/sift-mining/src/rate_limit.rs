//! Per-host politeness delay.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;
use url::Url;

/// Spaces out request starts against the same host.
///
/// Requests to one host are serialised through that host's gate; different
/// hosts never wait on each other.
#[derive(Debug, Default)]
pub struct HostRateLimiter {
    hosts: DashMap<String, Arc<Mutex<Option<Instant>>>>,
}

impl HostRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until a request to `url` may start, at least `min_interval`
    /// after the previous one to the same host.
    pub async fn acquire(&self, url: &str, min_interval: Duration) {
        if min_interval.is_zero() {
            return;
        }
        let host = host_key(url);
        let gate = self
            .hosts
            .entry(host.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let mut last = gate.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + min_interval;
            if ready_at > Instant::now() {
                let wait_ms = (ready_at - Instant::now()).as_millis() as u64;
                trace!(host = %host, wait_ms, "Rate limited");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    pub fn tracked_hosts(&self) -> usize {
        self.hosts.len()
    }
}

/// Host (with port, if any) used as the limiter key.
pub fn host_key(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        },
        Err(_) => String::new(),
    }
}
