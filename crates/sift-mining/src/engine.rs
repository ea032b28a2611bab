//! Mining engine: worker pool, progress aggregator and the job API.

use crate::cache::UrlCache;
use crate::config::MiningConfig;
use crate::error::{MiningError, Result};
use crate::extract::ExtractorRegistry;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::queue::TaskQueue;
use crate::rate_limit::HostRateLimiter;
use crate::registry::JobRegistry;
use crate::store::{InMemoryResultStore, ResultStore};
use crate::types::{JobEvent, JobSpec, JobStatusReport, MiningJob};
use crate::worker::{run_worker, TaskEvent, WorkerContext};
use parking_lot::Mutex;
use sift_core::{Clock, JobId, SystemClock};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builder for [`MiningEngine`].
pub struct MiningEngineBuilder {
    config: MiningConfig,
    fetcher: Option<Arc<dyn Fetcher>>,
    store: Option<Arc<dyn ResultStore>>,
    clock: Arc<dyn Clock>,
    extractors: ExtractorRegistry,
}

impl MiningEngineBuilder {
    pub fn new(config: MiningConfig) -> Self {
        Self {
            config,
            fetcher: None,
            store: None,
            clock: Arc::new(SystemClock),
            extractors: ExtractorRegistry::new(),
        }
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn extractors(mut self, extractors: ExtractorRegistry) -> Self {
        self.extractors = extractors;
        self
    }

    /// Spawn the worker pool and the aggregator on the current runtime.
    pub async fn start(self) -> Result<MiningEngine> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(
                HttpFetcher::new(&config.user_agent)
                    .map_err(|e| MiningError::Fetch(e.to_string()))?,
            ),
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryResultStore::new()));

        let cache = Arc::new(UrlCache::new(config.default_ttl_ms, self.clock.clone()));
        if let Some(path) = config.cache_snapshot_path.as_deref() {
            if path.exists() {
                match cache.load_snapshot(path).await {
                    Ok(loaded) => info!(path = %path.display(), loaded, "URL cache restored"),
                    Err(e) => warn!(
                        path = %path.display(),
                        error = %e,
                        "Ignoring unreadable cache snapshot"
                    ),
                }
            }
        }

        let queue = Arc::new(TaskQueue::new());
        let registry = Arc::new(JobRegistry::new(
            queue,
            cache,
            self.extractors,
            self.clock.clone(),
        ));

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(config.event_channel_capacity);

        let ctx = Arc::new(WorkerContext {
            registry: registry.clone(),
            fetcher,
            store: store.clone(),
            limiter: Arc::new(HostRateLimiter::new()),
            config: config.clone(),
            clock: self.clock,
            events: tx,
            cancel: cancel.clone(),
        });

        let workers = (0..config.workers)
            .map(|id| tokio::spawn(run_worker(id, ctx.clone())))
            .collect::<Vec<_>>();
        drop(ctx);

        let aggregator = tokio::spawn(aggregate(rx, registry.clone(), store.clone()));

        info!(workers = config.workers, "Mining engine started");
        Ok(MiningEngine {
            registry,
            store,
            config,
            cancel,
            workers: Mutex::new(workers),
            aggregator: Mutex::new(Some(aggregator)),
        })
    }
}

/// Single consumer of worker events; the only writer of job progress.
async fn aggregate(
    mut rx: mpsc::Receiver<TaskEvent>,
    registry: Arc<JobRegistry>,
    store: Arc<dyn ResultStore>,
) {
    while let Some(event) = rx.recv().await {
        let changed = match event {
            TaskEvent::Settled(result) => {
                let job_id = result.entry.job_id;
                registry.apply_result(&result).map(|_| job_id)
            }
            TaskEvent::Discovered { job_id, depth, links } => {
                registry.apply_discovery(job_id, depth, &links);
                None
            }
            TaskEvent::Crashed { entry, message } => registry
                .record_crash(&entry, &message)
                .map(|_| entry.job_id),
        };

        if let Some(job_id) = changed {
            persist_job(&registry, store.as_ref(), job_id).await;
        }
    }
    debug!("Aggregator finished");
}

async fn persist_job(registry: &JobRegistry, store: &dyn ResultStore, job_id: JobId) {
    let Ok(job) = registry.get_job(job_id) else {
        return;
    };
    if let Err(e) = store.save_job_state(&job).await {
        warn!(%job_id, error = %e, "Failed to persist job state");
    }
}

/// Running mining pipeline.
pub struct MiningEngine {
    registry: Arc<JobRegistry>,
    store: Arc<dyn ResultStore>,
    config: Arc<MiningConfig>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    aggregator: Mutex<Option<JoinHandle<()>>>,
}

impl MiningEngine {
    pub fn builder(config: MiningConfig) -> MiningEngineBuilder {
        MiningEngineBuilder::new(config)
    }

    /// Start an engine with the given collaborators and the system clock.
    pub async fn start(
        config: MiningConfig,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn ResultStore>,
    ) -> Result<Self> {
        MiningEngineBuilder::new(config)
            .fetcher(fetcher)
            .store(store)
            .start()
            .await
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<UrlCache> {
        self.registry.cache()
    }

    pub fn config(&self) -> &MiningConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.registry.subscribe()
    }

    pub async fn create_job(&self, spec: JobSpec) -> Result<JobId> {
        let job_id = self.registry.create_job(spec)?;
        self.persist(job_id).await;
        Ok(job_id)
    }

    pub fn expand_job(&self, job_id: JobId) -> Result<usize> {
        self.registry.expand_job(job_id)
    }

    pub async fn start_job(&self, job_id: JobId) -> Result<()> {
        self.registry.start_job(job_id)?;
        self.persist(job_id).await;
        Ok(())
    }

    /// Create and immediately start a job.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobId> {
        let job_id = self.create_job(spec).await?;
        self.start_job(job_id).await?;
        Ok(job_id)
    }

    pub async fn pause_job(&self, job_id: JobId) -> Result<()> {
        self.registry.pause_job(job_id)?;
        self.persist(job_id).await;
        Ok(())
    }

    pub async fn resume_job(&self, job_id: JobId) -> Result<()> {
        self.registry.resume_job(job_id)?;
        self.persist(job_id).await;
        Ok(())
    }

    pub async fn stop_job(&self, job_id: JobId) -> Result<usize> {
        let purged = self.registry.stop_job(job_id)?;
        self.persist(job_id).await;
        Ok(purged)
    }

    /// Remove a terminal job from the registry; its last snapshot stays in the store.
    pub async fn delete_job(&self, job_id: JobId) -> Result<MiningJob> {
        self.registry.delete_job(job_id)
    }

    pub fn get_status(&self, job_id: JobId) -> Result<JobStatusReport> {
        self.registry.get_status(job_id)
    }

    pub fn list_jobs(&self) -> Vec<MiningJob> {
        self.registry.list_jobs()
    }

    pub async fn load_job_state(&self, job_id: JobId) -> Result<Option<MiningJob>> {
        self.store.load_job_state(job_id).await
    }

    /// Resolve once the job reaches a terminal status.
    pub async fn wait_for_terminal(&self, job_id: JobId) -> Result<JobStatusReport> {
        let mut events = self.registry.subscribe();
        loop {
            let report = self.registry.get_status(job_id)?;
            if report.status.is_terminal() {
                return Ok(report);
            }
            // Any event (or a lag) is a cue to re-read the status.
            if let Err(broadcast::error::RecvError::Closed) = events.recv().await {
                return self.registry.get_status(job_id);
            }
        }
    }

    /// Stop all workers, drain pending events and save the cache snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        let aggregator = self.aggregator.lock().take();
        if let Some(handle) = aggregator {
            if let Err(e) = handle.await {
                warn!(error = %e, "Aggregator task ended abnormally");
            }
        }

        if let Some(path) = self.config.cache_snapshot_path.as_deref() {
            self.cache().save_snapshot(path).await?;
        }
        info!("Mining engine stopped");
        Ok(())
    }

    async fn persist(&self, job_id: JobId) {
        persist_job(&self.registry, self.store.as_ref(), job_id).await;
    }
}

impl Drop for MiningEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
