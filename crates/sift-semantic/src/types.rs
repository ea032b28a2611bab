//! Core types for chunking, indexing and retrieval.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A vector embedding.
pub type Vector = Vec<f32>;

/// Stable identifier of a chunk.
pub type ChunkId = String;

/// Embedding model identity. Two indexes are comparable only if their models are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmbeddingModel {
    pub provider: String,
    pub model_name: String,
    pub dimension: usize,
}

impl EmbeddingModel {
    pub fn new(
        provider: impl Into<String>,
        model_name: impl Into<String>,
        dimension: usize,
    ) -> Self {
        Self {
            provider: provider.into(),
            model_name: model_name.into(),
            dimension,
        }
    }

    pub fn openai_small() -> Self {
        Self::new("openai", "text-embedding-3-small", 1536)
    }

    pub fn ollama(model: &str, dimension: usize) -> Self {
        Self::new("ollama", model, dimension)
    }
}

impl fmt::Display for EmbeddingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({}d)", self.provider, self.model_name, self.dimension)
    }
}

/// A contiguous, line-addressed slice of a source document with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: ChunkId,
    pub source_path: String,
    /// 1-based, inclusive
    pub start_line: usize,
    /// 1-based, inclusive
    pub end_line: usize,
    pub content: String,
    pub content_hash: String,
    pub embedding: Vector,
    pub model: String,
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedChunk {
    pub chunk_id: ChunkId,
    pub source_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub similarity: f32,
}

impl RankedChunk {
    pub fn from_chunk(chunk: &DocumentChunk, similarity: f32) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            source_path: chunk.source_path.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            content: chunk.content.clone(),
            similarity,
        }
    }

    pub fn token_estimate(&self) -> usize {
        estimate_tokens(&self.content)
    }
}

/// Chunks selected for a token budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub chunks: Vec<RankedChunk>,
    pub token_estimate: usize,
}

impl ContextBundle {
    /// Chunks rendered with a `path:start-end` header each.
    pub fn render(&self) -> String {
        self.chunks
            .iter()
            .map(|c| format!("// {}:{}-{}\n{}", c.source_path, c.start_line, c.end_line, c.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Outcome of indexing one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub chunk_ids: Vec<ChunkId>,
    /// Chunks sent to the embedding provider
    pub embedded: usize,
    /// Chunks whose vector was carried over from the previous version
    pub reused: usize,
    /// Chunks left unindexed after retries
    pub failed: usize,
    /// Chunks of the previous version that were dropped
    pub pruned: usize,
    /// The content hash matched and nothing was done
    pub unchanged: bool,
}

/// Outcome of indexing a directory tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexReport {
    pub files_seen: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub files_failed: usize,
    pub chunks_embedded: usize,
    pub chunks_reused: usize,
    pub chunks_failed: usize,
}

impl IndexReport {
    pub(crate) fn add(&mut self, update: &UpdateReport) {
        if update.unchanged {
            self.files_unchanged += 1;
        } else {
            self.files_indexed += 1;
        }
        self.chunks_embedded += update.embedded;
        self.chunks_reused += update.reused;
        self.chunks_failed += update.failed;
    }
}

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Cosine similarity of two equally sized vectors; 0 when either is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Normalize a vector to unit length.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}
