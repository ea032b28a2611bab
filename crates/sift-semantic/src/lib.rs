//! Semantic indexing and retrieval for sift.
//!
//! Documents are split into overlapping line windows by the [`LineChunker`],
//! embedded through an [`EmbeddingProvider`] and stored in a [`VectorIndex`]
//! that remembers which model produced its vectors. The [`Indexer`] keeps the
//! index current as files change; [`SemanticSearch`] ranks chunks for a query
//! and packs the best of them into a token budget.
//!
//! # Example
//!
//! ```no_run
//! use sift_semantic::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> sift_semantic::Result<()> {
//! let provider = create_provider(&EmbeddingConfig::default())?;
//! let indexer = Indexer::new(provider.clone(), LineChunker::new(200, 20)?);
//!
//! indexer.index_document("notes.md", "how the cache decides freshness").await?;
//!
//! let search = SemanticSearch::new(indexer.index(), provider);
//! for hit in search.search("cache freshness", 5, 0.2).await? {
//!     println!("{}:{}-{} {:.3}", hit.source_path, hit.start_line, hit.end_line, hit.similarity);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod chunker;
pub mod config;
pub mod error;
pub mod index;
pub mod indexer;
pub mod providers;
pub mod search;
pub mod source;
pub mod types;

pub use cache::{EmbeddingCache, EmbeddingCacheKey};
pub use chunker::{ChunkDraft, LineChunker};
pub use config::{
    CacheConfig, ChunkingConfig, EmbeddingConfig, IndexConfig, SearchConfig, SemanticConfig,
};
pub use error::{Result, SemanticError};
pub use index::{FileEntry, VectorIndex};
pub use indexer::Indexer;
pub use providers::{
    EmbeddingProvider, MockProvider, OllamaProvider, OpenAIProvider, RetryingProvider,
    create_provider,
};
pub use search::SemanticSearch;
pub use source::{ContentSource, FsContentSource, SourceContent, discover_files};
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::chunker::LineChunker;
    pub use crate::config::{EmbeddingConfig, SemanticConfig};
    pub use crate::error::SemanticError;
    pub use crate::index::VectorIndex;
    pub use crate::indexer::Indexer;
    pub use crate::providers::{EmbeddingProvider, MockProvider, create_provider};
    pub use crate::search::SemanticSearch;
    pub use crate::types::{ContextBundle, EmbeddingModel, RankedChunk};
}
