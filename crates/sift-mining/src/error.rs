//! Error types for the mining pipeline.
//!
//! Only job-level problems surface as [`MiningError`]. Failures of an
//! individual task are recorded on the job progress (see
//! [`crate::types::TaskFailure`]) and never abort the worker pool.

use crate::types::JobStatus;
use sift_core::{JobId, SiftError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MiningError>;

#[derive(Debug, Error)]
pub enum MiningError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Invalid attribute '{name}': {reason}")]
    InvalidAttribute { name: String, reason: String },

    #[error("Job already exists: {0}")]
    DuplicateJob(JobId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] SiftError),
}

impl MiningError {
    pub fn invalid_job(msg: impl Into<String>) -> Self {
        Self::InvalidJob(msg.into())
    }

    pub fn invalid_attribute(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAttribute {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
