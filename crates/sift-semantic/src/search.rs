//! Query-time retrieval and token-budgeted context assembly.

use crate::cache::{EmbeddingCache, EmbeddingCacheKey};
use crate::config::SearchConfig;
use crate::error::{Result, SemanticError};
use crate::index::VectorIndex;
use crate::providers::EmbeddingProvider;
use crate::types::{ContextBundle, RankedChunk, Vector};
use parking_lot::RwLock;
use sift_core::SiftError;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Answers queries against a shared [`VectorIndex`].
///
/// Queries are embedded with the searcher's own provider. If that provider's
/// model is not the one the index was built with, every query fails rather
/// than comparing vectors from different spaces.
pub struct SemanticSearch {
    index: Arc<RwLock<VectorIndex>>,
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    config: SearchConfig,
}

impl SemanticSearch {
    pub fn new(index: Arc<RwLock<VectorIndex>>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            index,
            provider,
            cache: EmbeddingCache::new(1_000, Duration::from_secs(3_600)),
            config: SearchConfig::default(),
        }
    }

    /// Search a standalone index, e.g. one just loaded from disk.
    pub fn from_index(index: VectorIndex, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self::new(Arc::new(RwLock::new(index)), provider)
    }

    pub fn with_cache(mut self, cache: EmbeddingCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_config(mut self, config: SearchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    fn check_model(&self) -> Result<()> {
        let index = self.index.read();
        let indexed = index.model();
        let query = self.provider.model();

        if indexed.dimension != query.dimension {
            return Err(SemanticError::DimensionMismatch {
                expected: indexed.dimension,
                got: query.dimension,
            });
        }
        if indexed != query {
            return Err(SemanticError::ModelMismatch {
                index: indexed.to_string(),
                query: query.to_string(),
            });
        }
        Ok(())
    }

    async fn embed_query(&self, query: &str) -> Result<Arc<Vector>> {
        let key = EmbeddingCacheKey::new(query, self.provider.model().to_string());
        if let Some(vector) = self.cache.get(&key).await {
            debug!("Query embedding cache hit");
            return Ok(vector);
        }

        let vector = self.provider.embed(query).await?;
        if vector.len() != self.provider.dimension() {
            return Err(SemanticError::DimensionMismatch {
                expected: self.provider.dimension(),
                got: vector.len(),
            });
        }
        Ok(self.cache.insert(key, vector).await)
    }

    /// Top `top_k` chunks with similarity at least `min_similarity`, best first.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<RankedChunk>> {
        if query.trim().is_empty() {
            return Err(SiftError::invalid_input("query must not be empty").into());
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        self.check_model()?;
        let vector = self.embed_query(query).await?;

        // The index may have been switched while the query was being embedded.
        self.check_model()?;
        let results = self.index.read().search(&vector, top_k, min_similarity)?;

        debug!(query, top_k, results = results.len(), "Search completed");
        Ok(results)
    }

    /// Search with the configured defaults.
    pub async fn search_default(&self, query: &str) -> Result<Vec<RankedChunk>> {
        self.search(
            query,
            self.config.default_top_k,
            self.config.default_min_similarity,
        )
        .await
    }

    /// Highest-ranked chunks that fit in `max_tokens`.
    ///
    /// Chunks are taken in rank order until the next one would overflow the
    /// budget. The estimate of the returned bundle never exceeds `max_tokens`.
    pub async fn assemble_context(&self, query: &str, max_tokens: usize) -> Result<ContextBundle> {
        let candidates = self
            .search(
                query,
                self.config.context_candidates.max(1),
                self.config.default_min_similarity,
            )
            .await?;

        let mut bundle = ContextBundle::default();
        for chunk in candidates {
            let tokens = chunk.token_estimate();
            if bundle.token_estimate + tokens > max_tokens {
                break;
            }
            bundle.token_estimate += tokens;
            bundle.chunks.push(chunk);
        }

        debug!(
            query,
            max_tokens,
            chunks = bundle.chunks.len(),
            tokens = bundle.token_estimate,
            "Context assembled"
        );
        Ok(bundle)
    }
}
