//! Query embedding cache.

use crate::config::CacheConfig;
use crate::types::Vector;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// Cache key for query embeddings. The model is part of the key so that a
/// model switch never serves a stale vector.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct EmbeddingCacheKey {
    text: String,
    model: String,
}

impl EmbeddingCacheKey {
    pub fn new(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: model.into(),
        }
    }
}

/// Cache for embeddings.
pub struct EmbeddingCache {
    cache: Cache<EmbeddingCacheKey, Arc<Vector>>,
}

impl EmbeddingCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.query_cache_size,
            Duration::from_secs(config.query_cache_ttl_secs.max(1)),
        )
    }

    pub async fn get(&self, key: &EmbeddingCacheKey) -> Option<Arc<Vector>> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: EmbeddingCacheKey, value: Vector) -> Arc<Vector> {
        let value = Arc::new(value);
        self.cache.insert(key, value.clone()).await;
        value
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keyed_by_model() {
        let cache = EmbeddingCache::new(10, Duration::from_secs(60));
        cache
            .insert(EmbeddingCacheKey::new("query", "model-a"), vec![1.0])
            .await;

        assert!(cache.get(&EmbeddingCacheKey::new("query", "model-a")).await.is_some());
        assert!(cache.get(&EmbeddingCacheKey::new("query", "model-b")).await.is_none());

        cache.clear();
        cache.cache.run_pending_tasks().await;
        assert!(cache.get(&EmbeddingCacheKey::new("query", "model-a")).await.is_none());
    }
}
