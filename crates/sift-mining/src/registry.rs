//! Job registry: lifecycle state machine, task expansion and progress.
//!
//! The registry is the single owner of every job. Workers never mutate a
//! job directly; they report through the engine's aggregator, which calls
//! [`JobRegistry::apply_result`] and friends from one task.

use crate::cache::UrlCache;
use crate::error::{MiningError, Result};
use crate::extract::{normalize_url, CompiledAttribute, ExtractorRegistry};
use crate::queue::TaskQueue;
use crate::types::{
    FailureReason, JobConfig, JobEvent, JobProgress, JobSpec, JobStatus, JobStatusReport, MiningJob,
    TaskEntry, TaskFailure, TaskOutcome, TaskResult,
};
use parking_lot::RwLock;
use regex::Regex;
use sift_core::{Clock, JobId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Immutable, pre-validated view of a job used by workers.
#[derive(Debug)]
pub struct CompiledJob {
    pub job_id: JobId,
    pub config: JobConfig,
    attributes: HashMap<String, CompiledAttribute>,
    order: Vec<String>,
    lead: String,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl CompiledJob {
    fn compile(job_id: JobId, spec: &JobSpec, extractors: &ExtractorRegistry) -> Result<Self> {
        let mut attributes = HashMap::new();
        let mut order = Vec::new();
        for attr in &spec.attributes {
            let compiled = CompiledAttribute::compile(attr, extractors)?;
            let name = compiled.name().to_string();
            if attributes.insert(name.clone(), compiled).is_some() {
                return Err(MiningError::invalid_attribute(name, "duplicate attribute name"));
            }
            order.push(name);
        }

        // Highest priority wins; the first declared attribute breaks ties.
        let lead = spec
            .attributes
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ib.cmp(ia)))
            .map(|(_, a)| a.name.clone())
            .ok_or_else(|| MiningError::invalid_job("attributes must not be empty"))?;

        let compile_patterns = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        MiningError::invalid_job(format!("bad url pattern '{p}': {e}"))
                    })
                })
                .collect()
        };

        Ok(Self {
            job_id,
            config: spec.config.clone(),
            include: compile_patterns(&spec.config.url_patterns.include)?,
            exclude: compile_patterns(&spec.config.url_patterns.exclude)?,
            attributes,
            order,
            lead,
        })
    }

    pub fn attribute(&self, name: &str) -> Option<&CompiledAttribute> {
        self.attributes.get(name)
    }

    /// Attribute whose task also reports the page's links.
    pub fn lead_attribute(&self) -> &str {
        &self.lead
    }

    pub fn url_allowed(&self, url: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|r| r.is_match(url));
        included && !self.exclude.iter().any(|r| r.is_match(url))
    }

    fn tasks_for(&self, url: &str, depth: u32) -> Vec<TaskEntry> {
        self.order
            .iter()
            .filter_map(|name| self.attributes.get(name))
            .map(|attr| TaskEntry {
                job_id: self.job_id,
                url: url.to_string(),
                attribute: attr.name().to_string(),
                priority: attr.spec().priority,
                attempt: 0,
                max_attempts: self.config.max_attempts,
                depth,
                discover_links: attr.name() == self.lead && depth < self.config.max_depth,
            })
            .collect()
    }
}

struct JobRecord {
    job: MiningJob,
    compiled: Arc<CompiledJob>,
    seen_urls: HashSet<String>,
    outstanding: HashMap<String, usize>,
    expanded: bool,
}

impl JobRecord {
    /// Register `url` and build its tasks, unless it was seen or the URL budget is spent.
    fn admit_url(&mut self, url: String, depth: u32) -> Vec<TaskEntry> {
        if self.seen_urls.contains(&url) || self.seen_urls.len() >= self.job.config.max_urls {
            return Vec::new();
        }
        let tasks = self.compiled.tasks_for(&url, depth);
        self.job.progress.urls_total += 1;
        self.job.progress.tasks_total += tasks.len() as u64;
        self.outstanding.insert(url.clone(), tasks.len());
        self.seen_urls.insert(url);
        tasks
    }
}

/// What a worker should do with an entry it just dequeued.
#[derive(Debug)]
pub enum Dispatch {
    Run(Arc<CompiledJob>),
    /// Job is paused; hand the entry back to the queue.
    Defer,
    /// Job is gone or finished; discard the entry.
    Drop,
}

/// Owner of all mining jobs.
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    queue: Arc<TaskQueue>,
    cache: Arc<UrlCache>,
    extractors: ExtractorRegistry,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<JobEvent>,
}

impl JobRegistry {
    pub fn new(
        queue: Arc<TaskQueue>,
        cache: Arc<UrlCache>,
        extractors: ExtractorRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            jobs: RwLock::new(HashMap::new()),
            queue,
            cache,
            extractors,
            clock,
            events,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<UrlCache> {
        &self.cache
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Validate and register a job in `pending`. Nothing is enqueued yet.
    pub fn create_job(&self, spec: JobSpec) -> Result<JobId> {
        if spec.seed_urls.is_empty() {
            return Err(MiningError::invalid_job("seed_urls must not be empty"));
        }
        if spec.attributes.is_empty() {
            return Err(MiningError::invalid_job("attributes must not be empty"));
        }
        let config = &spec.config;
        if config.max_attempts == 0 {
            return Err(MiningError::invalid_job("max_attempts must be at least 1"));
        }
        if config.max_urls == 0 {
            return Err(MiningError::invalid_job("max_urls must be at least 1"));
        }
        if config.timeout_ms == 0 {
            return Err(MiningError::invalid_job("timeout_ms must be positive"));
        }

        let mut seeds = Vec::with_capacity(spec.seed_urls.len());
        for seed in &spec.seed_urls {
            let url = normalize_url(seed)
                .ok_or_else(|| MiningError::invalid_job(format!("invalid seed url '{seed}'")))?;
            if !seeds.contains(&url) {
                seeds.push(url);
            }
        }

        let job_id = spec.job_id.unwrap_or_default();
        let compiled = Arc::new(CompiledJob::compile(job_id, &spec, &self.extractors)?);

        let now = self.clock.now();
        let job = MiningJob {
            job_id,
            subject: spec.subject,
            seed_urls: seeds,
            attributes: spec.attributes,
            status: JobStatus::Pending,
            config: spec.config,
            progress: JobProgress::default(),
            created_at: now,
            updated_at: now,
            failure: None,
        };

        {
            let mut jobs = self.jobs.write();
            if jobs.contains_key(&job_id) {
                return Err(MiningError::DuplicateJob(job_id));
            }
            for attr in &job.attributes {
                self.cache.register_schema_version(&attr.name, &attr.schema_version);
            }
            // Entries stay parked until the job starts.
            self.queue.pause_job(job_id);
            jobs.insert(
                job_id,
                JobRecord {
                    job,
                    compiled,
                    seen_urls: HashSet::new(),
                    outstanding: HashMap::new(),
                    expanded: false,
                },
            );
        }

        info!(%job_id, "Mining job created");
        self.emit(job_id, JobStatus::Pending);
        Ok(job_id)
    }

    /// Turn the seed URLs into `(url × attribute)` entries and enqueue them.
    ///
    /// Idempotent: a second call enqueues nothing. Returns the number of entries enqueued.
    pub fn expand_job(&self, job_id: JobId) -> Result<usize> {
        let tasks = {
            let mut jobs = self.jobs.write();
            let record = jobs.get_mut(&job_id).ok_or(MiningError::JobNotFound(job_id))?;
            if record.expanded || record.job.status.is_terminal() {
                return Ok(0);
            }
            record.expanded = true;

            let seeds = record.job.seed_urls.clone();
            let mut tasks = Vec::new();
            for seed in seeds {
                tasks.extend(record.admit_url(seed, 0));
            }
            tasks
        };

        let count = self.queue.enqueue(tasks);
        debug!(%job_id, tasks = count, "Job expanded");
        Ok(count)
    }

    /// `pending -> running`: expand if needed and release the job's entries.
    pub fn start_job(&self, job_id: JobId) -> Result<()> {
        self.expand_job(job_id)?;
        let completed = {
            let mut jobs = self.jobs.write();
            let record = jobs.get_mut(&job_id).ok_or(MiningError::JobNotFound(job_id))?;
            self.transition(record, JobStatus::Running)?;
            self.complete_if_settled(record)
        };
        self.queue.resume_job(job_id);
        info!(%job_id, "Mining job started");
        self.emit(job_id, JobStatus::Running);
        if completed {
            self.emit(job_id, JobStatus::Completed);
        }
        Ok(())
    }

    pub fn pause_job(&self, job_id: JobId) -> Result<()> {
        {
            let mut jobs = self.jobs.write();
            let record = jobs.get_mut(&job_id).ok_or(MiningError::JobNotFound(job_id))?;
            self.transition(record, JobStatus::Paused)?;
            self.queue.pause_job(job_id);
        }
        info!(%job_id, "Mining job paused");
        self.emit(job_id, JobStatus::Paused);
        Ok(())
    }

    pub fn resume_job(&self, job_id: JobId) -> Result<()> {
        let completed = {
            let mut jobs = self.jobs.write();
            let record = jobs.get_mut(&job_id).ok_or(MiningError::JobNotFound(job_id))?;
            self.transition(record, JobStatus::Running)?;
            self.queue.resume_job(job_id);
            self.complete_if_settled(record)
        };
        info!(%job_id, "Mining job resumed");
        self.emit(job_id, JobStatus::Running);
        if completed {
            self.emit(job_id, JobStatus::Completed);
        }
        Ok(())
    }

    /// Stop a job and purge its pending entries. In-flight tasks finish normally.
    pub fn stop_job(&self, job_id: JobId) -> Result<usize> {
        let purged = {
            let mut jobs = self.jobs.write();
            let record = jobs.get_mut(&job_id).ok_or(MiningError::JobNotFound(job_id))?;
            self.transition(record, JobStatus::Stopped)?;
            self.queue.stop_job(job_id)
        };
        info!(%job_id, purged, "Mining job stopped");
        self.emit(job_id, JobStatus::Stopped);
        Ok(purged)
    }

    /// Move a job to `failed` and purge its pending entries.
    pub fn fail_job(&self, job_id: JobId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        {
            let mut jobs = self.jobs.write();
            let record = jobs.get_mut(&job_id).ok_or(MiningError::JobNotFound(job_id))?;
            self.transition(record, JobStatus::Failed)?;
            record.job.failure = Some(reason.clone());
            self.queue.stop_job(job_id);
        }
        warn!(%job_id, reason = %reason, "Mining job failed");
        self.emit(job_id, JobStatus::Failed);
        Ok(())
    }

    /// Remove a finished job. Only terminal jobs can be deleted.
    pub fn delete_job(&self, job_id: JobId) -> Result<MiningJob> {
        let removed = {
            let mut jobs = self.jobs.write();
            let record = jobs.get(&job_id).ok_or(MiningError::JobNotFound(job_id))?;
            if !record.job.status.is_terminal() {
                return Err(MiningError::invalid_job(format!(
                    "job {job_id} is {} and cannot be deleted",
                    record.job.status
                )));
            }
            jobs.remove(&job_id).map(|r| r.job)
        };
        self.queue.forget_job(job_id);
        info!(%job_id, "Mining job deleted");
        removed.ok_or(MiningError::JobNotFound(job_id))
    }

    pub fn get_status(&self, job_id: JobId) -> Result<JobStatusReport> {
        let jobs = self.jobs.read();
        let record = jobs.get(&job_id).ok_or(MiningError::JobNotFound(job_id))?;
        Ok(JobStatusReport {
            job_id,
            subject: record.job.subject.clone(),
            status: record.job.status,
            progress: record.job.progress,
            pending_tasks: self.queue.pending_for(job_id),
            failure: record.job.failure.clone(),
        })
    }

    pub fn get_job(&self, job_id: JobId) -> Result<MiningJob> {
        self.jobs
            .read()
            .get(&job_id)
            .map(|r| r.job.clone())
            .ok_or(MiningError::JobNotFound(job_id))
    }

    pub fn list_jobs(&self) -> Vec<MiningJob> {
        let mut jobs: Vec<_> = self.jobs.read().values().map(|r| r.job.clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Decide whether a dequeued entry may run now.
    pub fn dispatch(&self, entry: &TaskEntry) -> Dispatch {
        match self.jobs.read().get(&entry.job_id) {
            Some(record) => match record.job.status {
                JobStatus::Running => Dispatch::Run(record.compiled.clone()),
                JobStatus::Paused | JobStatus::Pending => Dispatch::Defer,
                _ => Dispatch::Drop,
            },
            None => Dispatch::Drop,
        }
    }

    /// Fold a settled task into its job's progress. Returns the new status
    /// when the job completed as a result.
    pub fn apply_result(&self, result: &TaskResult) -> Option<JobStatus> {
        let job_id = result.entry.job_id;
        let completed = {
            let mut jobs = self.jobs.write();
            let record = jobs.get_mut(&job_id)?;
            settle(record, result);
            self.complete_if_settled(record)
        };
        if completed {
            info!(%job_id, "Mining job completed");
            self.emit(job_id, JobStatus::Completed);
            Some(JobStatus::Completed)
        } else {
            None
        }
    }

    /// Count a panicked task as failed and escalate its job to `failed`.
    pub fn record_crash(&self, entry: &TaskEntry, message: &str) -> Option<JobStatus> {
        let result = TaskResult {
            entry: entry.clone(),
            outcome: TaskOutcome::Failed(TaskFailure {
                reason: FailureReason::Crashed,
                message: message.to_string(),
                attempts: entry.attempt + 1,
            }),
        };
        {
            let mut jobs = self.jobs.write();
            let record = jobs.get_mut(&entry.job_id)?;
            settle(record, &result);
            if record.job.status.is_terminal() {
                return None;
            }
        }
        self.fail_job(entry.job_id, format!("worker crashed: {message}"))
            .ok()
            .map(|()| JobStatus::Failed)
    }

    /// Enqueue tasks for links found on a page at `depth`. Returns the number of new URLs.
    pub fn apply_discovery(&self, job_id: JobId, depth: u32, links: &[String]) -> usize {
        let (tasks, admitted) = {
            let mut jobs = self.jobs.write();
            let Some(record) = jobs.get_mut(&job_id) else {
                return 0;
            };
            if record.job.status.is_terminal() || depth >= record.job.config.max_depth {
                return 0;
            }
            let mut tasks = Vec::new();
            let mut admitted = 0;
            for link in links {
                let Some(url) = normalize_url(link) else {
                    continue;
                };
                if !record.compiled.url_allowed(&url) {
                    continue;
                }
                let new_tasks = record.admit_url(url, depth + 1);
                if !new_tasks.is_empty() {
                    admitted += 1;
                    tasks.extend(new_tasks);
                }
            }
            (tasks, admitted)
        };

        if admitted > 0 {
            self.queue.enqueue(tasks);
            debug!(%job_id, admitted, depth = depth + 1, "Discovered URLs enqueued");
        }
        admitted
    }

    fn transition(&self, record: &mut JobRecord, to: JobStatus) -> Result<()> {
        let from = record.job.status;
        if !from.can_transition_to(to) {
            return Err(MiningError::InvalidTransition {
                job_id: record.job.job_id,
                from,
                to,
            });
        }
        record.job.status = to;
        record.job.updated_at = self.clock.now();
        Ok(())
    }

    fn complete_if_settled(&self, record: &mut JobRecord) -> bool {
        if record.job.status == JobStatus::Running
            && record.expanded
            && record.job.progress.is_settled()
            && self.queue.pending_for(record.job.job_id) == 0
        {
            record.job.status = JobStatus::Completed;
            record.job.updated_at = self.clock.now();
            return true;
        }
        false
    }

    fn emit(&self, job_id: JobId, status: JobStatus) {
        // No subscribers is fine.
        let _ = self.events.send(JobEvent { job_id, status });
    }
}

fn settle(record: &mut JobRecord, result: &TaskResult) {
    let progress = &mut record.job.progress;
    progress.tasks_done += 1;
    match &result.outcome {
        TaskOutcome::Succeeded { .. } => progress.succeeded += 1,
        TaskOutcome::SkippedFresh => progress.skipped_fresh += 1,
        TaskOutcome::Failed(_) => progress.failed += 1,
    }

    if let Some(left) = record.outstanding.get_mut(&result.entry.url) {
        *left = left.saturating_sub(1);
        if *left == 0 {
            record.outstanding.remove(&result.entry.url);
            progress.urls_done += 1;
        }
    }
}
