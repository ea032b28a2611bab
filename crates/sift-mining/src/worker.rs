//! Crawl workers.
//!
//! Each worker loops: dequeue, check the job, claim the cache key, wait for
//! the host's rate limit, then fetch and extract under the job's timeout.
//! A fresh lead task still fetches its page, but only to report links.
//! Outcomes go to the aggregator as [`TaskEvent`]s; a worker never touches
//! job progress itself.

use crate::cache::{CacheClaim, Freshness, UrlCache};
use crate::config::MiningConfig;
use crate::extract::{extract_links, CompiledAttribute, ExtractError, Page};
use crate::fetch::{FetchError, Fetcher};
use crate::rate_limit::HostRateLimiter;
use crate::registry::{Dispatch, JobRegistry};
use crate::store::{ExtractionRecord, ResultStore};
use crate::types::{FailureReason, JobConfig, TaskEntry, TaskFailure, TaskOutcome, TaskResult};
use futures::FutureExt;
use serde_json::Value;
use sift_core::{Clock, JobId};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Message from a worker to the aggregator.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A task reached its final outcome.
    Settled(TaskResult),
    /// Links found on a page; sent before the task's `Settled` event.
    Discovered {
        job_id: JobId,
        depth: u32,
        links: Vec<String>,
    },
    /// Processing panicked.
    Crashed { entry: TaskEntry, message: String },
}

/// Everything a worker needs, shared by the whole pool.
pub struct WorkerContext {
    pub registry: Arc<JobRegistry>,
    pub fetcher: Arc<dyn Fetcher>,
    pub store: Arc<dyn ResultStore>,
    pub limiter: Arc<HostRateLimiter>,
    pub config: Arc<MiningConfig>,
    pub clock: Arc<dyn Clock>,
    pub events: mpsc::Sender<TaskEvent>,
    pub cancel: CancellationToken,
}

impl WorkerContext {
    async fn emit(&self, event: TaskEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Aggregator gone, dropping task event");
        }
    }

    async fn settle(&self, entry: TaskEntry, outcome: TaskOutcome) {
        self.emit(TaskEvent::Settled(TaskResult { entry, outcome })).await;
    }
}

/// Releases a cache claim unless it was completed, including during unwinding.
struct ClaimGuard<'a> {
    cache: &'a UrlCache,
    claim: Option<CacheClaim>,
}

impl<'a> ClaimGuard<'a> {
    fn new(cache: &'a UrlCache, claim: CacheClaim) -> Self {
        Self {
            cache,
            claim: Some(claim),
        }
    }

    fn complete(mut self, schema_version: &str, ttl_ms: u64) {
        if let Some(claim) = self.claim.take() {
            self.cache
                .record_result_with_ttl(claim.url(), claim.attribute(), schema_version, ttl_ms);
        }
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if let Some(claim) = self.claim.take() {
            self.cache.release(claim);
        }
    }
}

enum AttemptError {
    Retryable(FailureReason, String),
    Permanent(FailureReason, String),
}

struct Extracted {
    value: Value,
    links: Vec<String>,
}

/// Run one worker until `ctx.cancel` fires.
pub async fn run_worker(worker_id: usize, ctx: Arc<WorkerContext>) {
    debug!(worker_id, "Worker started");
    let idle = ctx.config.idle_poll();

    while let Some(entry) = ctx.registry.queue().dequeue(&ctx.cancel, idle).await {
        trace!(worker_id, url = %entry.url, attribute = %entry.attribute, "Dequeued");
        let result = AssertUnwindSafe(process_entry(&ctx, entry.clone()))
            .catch_unwind()
            .await;

        if let Err(panic) = result {
            let message = panic_message(panic.as_ref());
            error!(
                worker_id,
                job_id = %entry.job_id,
                url = %entry.url,
                attribute = %entry.attribute,
                message = %message,
                "Task processing panicked"
            );
            ctx.emit(TaskEvent::Crashed { entry, message }).await;
        }
    }

    debug!(worker_id, "Worker stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Process a single dequeued entry to its next state.
pub async fn process_entry(ctx: &WorkerContext, entry: TaskEntry) {
    let job = match ctx.registry.dispatch(&entry) {
        Dispatch::Run(job) => job,
        Dispatch::Defer => {
            // The queue parks it until the job resumes.
            ctx.registry.queue().requeue(entry, Duration::ZERO);
            return;
        }
        Dispatch::Drop => return,
    };

    let Some(attribute) = job.attribute(&entry.attribute) else {
        let failure = TaskFailure {
            reason: FailureReason::Extraction,
            message: format!("unknown attribute '{}'", entry.attribute),
            attempts: entry.attempt + 1,
        };
        ctx.settle(entry, TaskOutcome::Failed(failure)).await;
        return;
    };

    let cache = ctx.registry.cache();
    let guard = match cache.check_and_claim(&entry.url, &entry.attribute) {
        Freshness::Fresh => {
            trace!(url = %entry.url, attribute = %entry.attribute, "Fresh, skipping");
            if entry.discover_links {
                rediscover_links(ctx, &entry, &job.config).await;
            }
            ctx.settle(entry, TaskOutcome::SkippedFresh).await;
            return;
        }
        Freshness::InFlight => {
            // Another job is mining the same key; look again shortly.
            ctx.registry.queue().requeue(entry, ctx.config.idle_poll());
            return;
        }
        Freshness::Stale(claim) => ClaimGuard::new(cache, claim),
    };

    ctx.limiter.acquire(&entry.url, job.config.rate_limit()).await;

    let timeout = job.config.timeout();
    let attempt = fetch_and_extract(ctx, &entry, attribute, timeout);
    let attempt = match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(AttemptError::Retryable(
            FailureReason::TransientFetch,
            format!("attempt exceeded {}ms", timeout.as_millis()),
        )),
    };

    let attempt = match attempt {
        Ok(extracted) => persist(ctx, &entry, attribute, &extracted.value)
            .await
            .map(|()| extracted),
        Err(e) => Err(e),
    };

    match attempt {
        Ok(extracted) => {
            let spec = attribute.spec();
            guard.complete(
                &spec.schema_version,
                spec.ttl_ms.unwrap_or_else(|| cache.default_ttl_ms()),
            );
            if !extracted.links.is_empty() {
                ctx.emit(TaskEvent::Discovered {
                    job_id: entry.job_id,
                    depth: entry.depth,
                    links: extracted.links,
                })
                .await;
            }
            ctx.settle(entry, TaskOutcome::Succeeded { value: extracted.value }).await;
        }
        Err(AttemptError::Retryable(reason, message)) => {
            drop(guard);
            if entry.has_attempts_left() {
                let backoff = ctx.config.backoff_for(entry.attempt);
                let next = entry.next_attempt();
                debug!(
                    url = %entry.url,
                    attribute = %entry.attribute,
                    attempt = next.attempt + 1,
                    max_attempts = entry.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %message,
                    "Retrying task"
                );
                if ctx.registry.queue().requeue(next, backoff) {
                    return;
                }
                // Job was stopped meanwhile; report what we have.
            }
            fail(ctx, entry, reason, message).await;
        }
        Err(AttemptError::Permanent(reason, message)) => {
            drop(guard);
            fail(ctx, entry, reason, message).await;
        }
    }
}

async fn fail(ctx: &WorkerContext, entry: TaskEntry, reason: FailureReason, message: String) {
    warn!(
        job_id = %entry.job_id,
        url = %entry.url,
        attribute = %entry.attribute,
        reason = %reason,
        error = %message,
        "Task failed"
    );
    let failure = TaskFailure {
        reason,
        message,
        attempts: entry.attempt + 1,
    };
    ctx.settle(entry, TaskOutcome::Failed(failure)).await;
}

async fn fetch_and_extract(
    ctx: &WorkerContext,
    entry: &TaskEntry,
    attribute: &CompiledAttribute,
    timeout: Duration,
) -> Result<Extracted, AttemptError> {
    let response = ctx
        .fetcher
        .fetch(&entry.url, timeout)
        .await
        .map_err(|e| match e {
            FetchError::InvalidUrl(_) => {
                AttemptError::Permanent(FailureReason::HttpStatus, e.to_string())
            }
            other => AttemptError::Retryable(FailureReason::TransientFetch, other.to_string()),
        })?;

    if !response.is_success() {
        let message = format!("HTTP {} from {}", response.status, entry.url);
        return Err(if response.is_retryable_status() {
            AttemptError::Retryable(FailureReason::TransientFetch, message)
        } else {
            AttemptError::Permanent(FailureReason::HttpStatus, message)
        });
    }

    let page = Page {
        url: &response.final_url,
        body: &response.body,
    };
    let value = attribute.extract(page).map_err(|e| match e {
        ExtractError::Validation(msg) => {
            AttemptError::Permanent(FailureReason::ValidationFailed, msg)
        }
        ExtractError::Parse(msg) => AttemptError::Retryable(FailureReason::Extraction, msg),
    })?;

    let links = if entry.discover_links {
        extract_links(&response.body, &response.final_url)
    } else {
        Vec::new()
    };

    Ok(Extracted { value, links })
}

/// Fetch a page whose data is still fresh, only to follow its links.
///
/// Failures are not retried; the task itself is already satisfied.
async fn rediscover_links(ctx: &WorkerContext, entry: &TaskEntry, config: &JobConfig) {
    ctx.limiter.acquire(&entry.url, config.rate_limit()).await;

    let timeout = config.timeout();
    let fetched = tokio::time::timeout(timeout, ctx.fetcher.fetch(&entry.url, timeout)).await;
    let response = match fetched {
        Ok(Ok(response)) if response.is_success() => response,
        Ok(Ok(response)) => {
            debug!(url = %entry.url, status = response.status, "Link fetch rejected");
            return;
        }
        Ok(Err(e)) => {
            debug!(url = %entry.url, error = %e, "Link fetch failed");
            return;
        }
        Err(_) => {
            let timeout_ms = timeout.as_millis() as u64;
            debug!(url = %entry.url, timeout_ms, "Link fetch timed out");
            return;
        }
    };

    let links = extract_links(&response.body, &response.final_url);
    if !links.is_empty() {
        ctx.emit(TaskEvent::Discovered {
            job_id: entry.job_id,
            depth: entry.depth,
            links,
        })
        .await;
    }
}

async fn persist(
    ctx: &WorkerContext,
    entry: &TaskEntry,
    attribute: &CompiledAttribute,
    value: &Value,
) -> Result<(), AttemptError> {
    let record = ExtractionRecord {
        job_id: entry.job_id,
        url: entry.url.clone(),
        attribute: entry.attribute.clone(),
        value: value.clone(),
        schema_version: attribute.spec().schema_version.clone(),
        extracted_at: ctx.clock.now(),
    };
    ctx.store
        .save_extraction_result(&record)
        .await
        .map_err(|e| AttemptError::Retryable(FailureReason::Persistence, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractorRegistry;
    use crate::fetch::FetchResponse;
    use crate::queue::TaskQueue;
    use crate::store::InMemoryResultStore;
    use crate::types::{AttributeSpec, JobSpec};
    use async_trait::async_trait;
    use sift_core::SystemClock;

    /// Never answers within any sane timeout.
    struct Stalled;

    #[async_trait]
    impl Fetcher for Stalled {
        async fn fetch(&self, url: &str, _timeout: Duration) -> Result<FetchResponse, FetchError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(FetchResponse::ok(url, "<title>late</title>"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_is_bounded_by_job_timeout() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let registry = Arc::new(JobRegistry::new(
            Arc::new(TaskQueue::new()),
            Arc::new(UrlCache::new(60_000, clock.clone())),
            ExtractorRegistry::new(),
            clock.clone(),
        ));
        let spec = JobSpec::new(
            "slow",
            vec!["http://slow.test/".into()],
            vec![AttributeSpec::new("title", 1)],
        )
        .with_config(JobConfig {
            rate_limit_ms: 0,
            timeout_ms: 250,
            max_attempts: 1,
            ..Default::default()
        });
        let job_id = registry.create_job(spec).unwrap();
        registry.start_job(job_id).unwrap();
        let entry = registry.queue().try_dequeue().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let ctx = WorkerContext {
            registry: registry.clone(),
            fetcher: Arc::new(Stalled),
            store: Arc::new(InMemoryResultStore::new()),
            limiter: Arc::new(HostRateLimiter::new()),
            config: Arc::new(MiningConfig::default()),
            clock,
            events: tx,
            cancel: CancellationToken::new(),
        };

        let started = tokio::time::Instant::now();
        process_entry(&ctx, entry).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");

        match rx.try_recv().unwrap() {
            TaskEvent::Settled(TaskResult {
                outcome: TaskOutcome::Failed(failure),
                ..
            }) => {
                assert_eq!(failure.reason, FailureReason::TransientFetch);
                assert!(failure.message.contains("250ms"), "{}", failure.message);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // The claim was released, so a later attempt may take the key again.
        assert!(matches!(
            registry.cache().check_and_claim("http://slow.test/", "title"),
            Freshness::Stale(_)
        ));
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
