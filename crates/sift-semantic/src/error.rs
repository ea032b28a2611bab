//! Error types for semantic indexing and search.

use sift_core::SiftError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SemanticError>;

#[derive(Debug, Error)]
pub enum SemanticError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Index error: {0}")]
    Index(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid dimension: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Model mismatch: index built with '{index}', query embedded with '{query}'")]
    ModelMismatch { index: String, query: String },

    #[error("Source error for '{path}': {reason}")]
    Source { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Core(#[from] SiftError),
}

impl SemanticError {
    /// Stable code reported to callers and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Provider(_) | Self::Api { .. } | Self::Http(_) => "EMBEDDING_PROVIDER_ERROR",
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::ModelMismatch { .. } => "MODEL_MISMATCH",
            Self::Index(_) => "INDEX_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Source { .. } | Self::Io(_) => "SOURCE_ERROR",
            Self::Json(_) | Self::Core(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether retrying the same embedding request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}
