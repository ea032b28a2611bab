//! Domain types for mining jobs and their tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sift_core::JobId;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a mining job.
///
/// Allowed transitions:
///
/// ```text
/// pending -> running <-> paused
/// running | paused -> stopped | failed
/// running -> completed
/// pending -> stopped
/// ```
///
/// `stopped`, `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Regex filters applied to discovered URLs. Seed URLs are taken as given.
///
/// A URL passes when it matches at least one `include` pattern (or
/// `include` is empty) and no `exclude` pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlPatterns {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Per-job crawl bounds and politeness settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// How many link hops to follow from the seeds (0 = seeds only)
    pub max_depth: u32,

    /// Maximum number of distinct URLs turned into tasks
    pub max_urls: usize,

    /// Minimum delay between request starts against the same host
    pub rate_limit_ms: u64,

    /// Bound on a single fetch + extract attempt
    pub timeout_ms: u64,

    /// Attempts per task before it is marked failed
    pub max_attempts: u32,

    pub url_patterns: UrlPatterns,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_depth: 0,
            max_urls: 100,
            rate_limit_ms: 1_000,
            timeout_ms: 30_000,
            max_attempts: 3,
            url_patterns: UrlPatterns::default(),
        }
    }
}

impl JobConfig {
    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Expected type of an extracted value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Text,
    Number,
    Date,
    Url,
    Image,
    Json,
}

/// Constraints an extracted value must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    pub required: bool,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// What to read from the nodes a selector matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractMethod {
    /// Whitespace-collapsed text of the first match
    #[default]
    Text,
    /// Named HTML attribute of the first match
    Attr(String),
    /// Number of matches
    Count,
}

/// How the value of an attribute is located in a page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    CssSelector(String),
    AutoDetect,
    /// Dispatched through [`crate::extract::ExtractorRegistry`] by id
    CustomFunction(String),
}

/// Prefix that routes a selector to a registered custom extractor.
pub const CUSTOM_SELECTOR_PREFIX: &str = "custom:";

/// A named piece of data to extract from every page of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub name: String,

    /// CSS selector; `None` means auto-detect, `custom:<id>` a custom extractor
    #[serde(default)]
    pub selector: Option<String>,

    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    #[serde(default)]
    pub data_type: DataType,

    #[serde(default)]
    pub validation: ValidationRules,

    #[serde(default)]
    pub method: ExtractMethod,

    /// Freshness override for this attribute
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

fn default_schema_version() -> String {
    "1.0.0".to_string()
}

impl AttributeSpec {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            selector: None,
            priority,
            schema_version: default_schema_version(),
            data_type: DataType::Text,
            validation: ValidationRules::default(),
            method: ExtractMethod::Text,
            ttl_ms: None,
        }
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_validation(mut self, validation: ValidationRules) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_method(mut self, method: ExtractMethod) -> Self {
        self.method = method;
        self
    }

    pub fn strategy(&self) -> ExtractionStrategy {
        match self.selector.as_deref().map(str::trim) {
            None | Some("") => ExtractionStrategy::AutoDetect,
            Some(s) => match s.strip_prefix(CUSTOM_SELECTOR_PREFIX) {
                Some(id) => ExtractionStrategy::CustomFunction(id.trim().to_string()),
                None => ExtractionStrategy::CssSelector(s.to_string()),
            },
        }
    }
}

/// Aggregated task counters of a job. Counters only ever grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub urls_total: u64,
    pub urls_done: u64,
    pub tasks_total: u64,
    pub tasks_done: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Tasks satisfied by a fresh cache entry without fetching
    pub skipped_fresh: u64,
}

impl JobProgress {
    pub fn is_settled(&self) -> bool {
        self.tasks_done >= self.tasks_total
    }

    pub fn fraction_done(&self) -> f64 {
        if self.tasks_total == 0 {
            1.0
        } else {
            self.tasks_done as f64 / self.tasks_total as f64
        }
    }
}

/// Submission payload for a new job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub job_id: Option<JobId>,

    #[serde(default)]
    pub subject: String,

    pub seed_urls: Vec<String>,

    pub attributes: Vec<AttributeSpec>,

    #[serde(default)]
    pub config: JobConfig,
}

impl JobSpec {
    pub fn new(
        subject: impl Into<String>,
        seed_urls: Vec<String>,
        attributes: Vec<AttributeSpec>,
    ) -> Self {
        Self {
            job_id: None,
            subject: subject.into(),
            seed_urls,
            attributes,
            config: JobConfig::default(),
        }
    }

    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

/// A mining job as tracked by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningJob {
    pub job_id: JobId,
    pub subject: String,
    pub seed_urls: Vec<String>,
    pub attributes: Vec<AttributeSpec>,
    pub status: JobStatus,
    pub config: JobConfig,
    pub progress: JobProgress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the job ended in `failed`
    #[serde(default)]
    pub failure: Option<String>,
}

/// One (url, attribute) unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub job_id: JobId,
    pub url: String,
    pub attribute: String,
    pub priority: i32,
    /// Attempts already made
    pub attempt: u32,
    pub max_attempts: u32,
    /// Link hops from a seed URL
    pub depth: u32,
    /// Whether this task reports outgoing links of the page
    pub discover_links: bool,
}

impl TaskEntry {
    pub fn new(
        job_id: JobId,
        url: impl Into<String>,
        attribute: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self {
            job_id,
            url: url.into(),
            attribute: attribute.into(),
            priority,
            attempt: 0,
            max_attempts: 1,
            depth: 0,
            discover_links: false,
        }
    }

    /// Copy of this entry for the following attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt.saturating_add(1) < self.max_attempts
    }
}

/// Why a task failed permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Timeout, connection error or retryable HTTP status, after all attempts
    #[serde(rename = "TRANSIENT_FETCH_ERROR")]
    TransientFetch,
    /// Extracted value did not satisfy the attribute's validation rules
    ValidationFailed,
    /// Non-retryable HTTP status
    HttpStatus,
    /// Page could not be processed by the extraction strategy
    #[serde(rename = "EXTRACTION_ERROR")]
    Extraction,
    /// The result could not be persisted
    #[serde(rename = "PERSISTENCE_ERROR")]
    Persistence,
    /// Processing panicked
    Crashed,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientFetch => "TRANSIENT_FETCH_ERROR",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::HttpStatus => "HTTP_STATUS",
            Self::Extraction => "EXTRACTION_ERROR",
            Self::Persistence => "PERSISTENCE_ERROR",
            Self::Crashed => "CRASHED",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub reason: FailureReason,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded { value: Value },
    SkippedFresh,
    Failed(TaskFailure),
}

/// Final result of a task, sent from a worker to the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub entry: TaskEntry,
    pub outcome: TaskOutcome,
}

/// Point-in-time view of a job returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: JobId,
    pub subject: String,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub pending_tasks: usize,
    pub failure: Option<String>,
}

/// Broadcast whenever a job changes status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub status: JobStatus,
}
