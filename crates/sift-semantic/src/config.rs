//! Configuration for semantic indexing and search.

use crate::error::{Result, SemanticError};
use serde::{Deserialize, Serialize};
use sift_core::config::{env_override, env_override_parse};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_EMBEDDING_PROVIDER: &str = "SIFT_EMBEDDING_PROVIDER";
pub const ENV_EMBEDDING_MODEL: &str = "SIFT_EMBEDDING_MODEL";
pub const ENV_EMBEDDING_DIMENSION: &str = "SIFT_EMBEDDING_DIMENSION";
pub const ENV_INDEX_PATH: &str = "SIFT_INDEX_PATH";

/// `[semantic]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub index: IndexConfig,
    pub search: SearchConfig,
    pub cache: CacheConfig,
}

impl SemanticConfig {
    /// Apply `SIFT_*` environment overrides for this section.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(provider) = env_override(ENV_EMBEDDING_PROVIDER) {
            self.embedding.provider = provider;
        }
        if let Some(model) = env_override(ENV_EMBEDDING_MODEL) {
            self.embedding.model = model;
        }
        if let Some(dimension) = env_override_parse::<usize>(ENV_EMBEDDING_DIMENSION)? {
            self.embedding.dimension = dimension;
        }
        if let Some(path) = env_override(ENV_INDEX_PATH) {
            self.index.persist_path = Some(PathBuf::from(path));
        }
        if self.embedding.api_key.is_none() && self.embedding.provider == "openai" {
            self.embedding.api_key = std::env::var("OPENAI_API_KEY").ok();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.embedding.validate()?;
        self.chunking.validate()?;
        if self.search.default_top_k == 0 {
            return Err(SemanticError::Config("search.default_top_k must be at least 1".into()));
        }
        if !(-1.0..=1.0).contains(&self.search.default_min_similarity) {
            return Err(SemanticError::Config(
                "search.default_min_similarity must be within [-1, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Embedding provider selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `mock`, `ollama` or `openai`
    pub provider: String,

    pub model: String,

    pub dimension: usize,

    /// Base URL; provider default when unset
    pub endpoint: Option<String>,

    /// API key (falls back to `OPENAI_API_KEY` for openai)
    pub api_key: Option<String>,

    pub timeout_secs: u64,

    /// Retries after the first failed request
    pub max_retries: u32,

    /// First retry delay; doubles per retry
    pub retry_base_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "mock-embedding".to_string(),
            dimension: 384,
            endpoint: None,
            api_key: None,
            timeout_secs: 30,
            max_retries: 3,
            retry_base_ms: 200,
        }
    }
}

impl EmbeddingConfig {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.provider.as_str(), "mock" | "ollama" | "openai") {
            return Err(SemanticError::Config(format!(
                "unknown embedding provider '{}'",
                self.provider
            )));
        }
        if self.dimension == 0 {
            return Err(SemanticError::Config("embedding.dimension must be positive".into()));
        }
        if self.model.trim().is_empty() {
            return Err(SemanticError::Config("embedding.model must not be empty".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Line-window chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Lines per chunk
    pub chunk_size: usize,
    /// Lines shared by consecutive chunks
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 200,
            overlap: 20,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SemanticError::Config("chunking.chunk_size must be positive".into()));
        }
        if self.overlap >= self.chunk_size {
            return Err(SemanticError::Config(
                "chunking.overlap must be smaller than chunk_size".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Where the index is saved; `<data_dir>/index.bin` when unset
    pub persist_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_top_k: usize,
    pub default_min_similarity: f32,
    /// How many ranked chunks context assembly considers
    pub context_candidates: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            default_min_similarity: 0.0,
            context_candidates: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub query_cache_size: u64,
    pub query_cache_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            query_cache_size: 1_000,
            query_cache_ttl_secs: 3_600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SemanticConfig::default();
        config.validate().unwrap();
        assert_eq!(config.chunking.chunk_size, 200);
        assert_eq!(config.chunking.overlap, 20);
        assert_eq!(config.search.default_top_k, 10);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let config = ChunkingConfig {
            chunk_size: 10,
            overlap: 10,
        };
        assert!(matches!(config.validate(), Err(SemanticError::Config(_))));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = EmbeddingConfig {
            provider: "onnx".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let config: SemanticConfig =
            serde_json::from_value(serde_json::json!({ "chunking": { "chunk_size": 50 } }))
                .unwrap();
        assert_eq!(config.chunking.chunk_size, 50);
        assert_eq!(config.chunking.overlap, 20);
        assert_eq!(config.embedding.provider, "mock");
    }
}
