//! Background data mining pipeline.
//!
//! A [`MiningEngine`] runs a fixed pool of workers over a shared
//! [`TaskQueue`]. Jobs are expanded into `(url × attribute)` tasks by the
//! [`JobRegistry`]; workers consult the [`UrlCache`] to skip fresh work,
//! fetch and extract the rest, and report outcomes over a bounded channel
//! to a single aggregator that owns job progress.
//!
//! ```no_run
//! use sift_mining::prelude::*;
//!
//! # async fn run() -> sift_mining::Result<()> {
//! let engine = MiningEngine::builder(MiningConfig::default()).start().await?;
//! let spec = JobSpec::new(
//!     "example",
//!     vec!["https://example.com".to_string()],
//!     vec![AttributeSpec::new("title", 10), AttributeSpec::new("description", 1)],
//! );
//! let job_id = engine.submit(spec).await?;
//! let report = engine.wait_for_terminal(job_id).await?;
//! println!("{:?}", report.progress);
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod store;
pub mod types;
pub mod worker;

pub use cache::{CacheClaim, CacheEntry, Freshness, UrlCache};
pub use config::MiningConfig;
pub use engine::{MiningEngine, MiningEngineBuilder};
pub use error::{MiningError, Result};
pub use extract::{CompiledAttribute, CustomExtractor, ExtractError, ExtractorRegistry, Page};
pub use fetch::{FetchError, FetchResponse, Fetcher, HttpFetcher};
pub use queue::TaskQueue;
pub use rate_limit::HostRateLimiter;
pub use registry::{CompiledJob, Dispatch, JobRegistry};
pub use store::{ExtractionRecord, InMemoryResultStore, JsonlResultStore, ResultStore};
pub use types::*;
pub use worker::TaskEvent;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::MiningConfig;
    pub use crate::engine::{MiningEngine, MiningEngineBuilder};
    pub use crate::error::MiningError;
    pub use crate::extract::{CustomExtractor, ExtractorRegistry};
    pub use crate::fetch::{FetchResponse, Fetcher, HttpFetcher};
    pub use crate::store::{InMemoryResultStore, JsonlResultStore, ResultStore};
    pub use crate::types::{
        AttributeSpec, DataType, ExtractMethod, JobConfig, JobSpec, JobStatus, UrlPatterns,
        ValidationRules,
    };
}
