//! In-memory vector index with exact cosine ranking.

use crate::error::{Result, SemanticError};
use crate::types::{ChunkId, DocumentChunk, EmbeddingModel, RankedChunk, Vector, cosine_similarity};
use bincode::config;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

const FORMAT_VERSION: u32 = 1;

/// Per-document bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Content hash of the indexed version; empty when some chunks failed to embed
    pub hash: String,
    pub chunk_ids: Vec<ChunkId>,
}

#[derive(Serialize, Deserialize)]
struct IndexData {
    version: u32,
    model: EmbeddingModel,
    chunks: Vec<DocumentChunk>,
    files: HashMap<String, FileEntry>,
}

/// Chunks of every indexed document, all embedded with a single model.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    model: EmbeddingModel,
    chunks: HashMap<ChunkId, DocumentChunk>,
    files: HashMap<String, FileEntry>,
}

impl VectorIndex {
    pub fn new(model: EmbeddingModel) -> Self {
        Self {
            model,
            chunks: HashMap::new(),
            files: HashMap::new(),
        }
    }

    pub fn model(&self) -> &EmbeddingModel {
        &self.model
    }

    pub fn dimension(&self) -> usize {
        self.model.dimension
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn file_hash(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(|f| f.hash.as_str())
    }

    pub fn file(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn chunk(&self, id: &str) -> Option<&DocumentChunk> {
        self.chunks.get(id)
    }

    /// Chunks of `path` ordered by start line.
    pub fn chunks_for(&self, path: &str) -> Vec<&DocumentChunk> {
        let mut chunks: Vec<&DocumentChunk> = self
            .files
            .get(path)
            .map(|f| f.chunk_ids.iter().filter_map(|id| self.chunks.get(id)).collect())
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.start_line);
        chunks
    }

    /// Vectors of `path`'s chunks keyed by chunk content hash.
    pub fn vectors_by_content(&self, path: &str) -> HashMap<String, Vector> {
        self.chunks_for(path)
            .into_iter()
            .map(|c| (c.content_hash.clone(), c.embedding.clone()))
            .collect()
    }

    fn check_chunk(&self, chunk: &DocumentChunk) -> Result<()> {
        if chunk.embedding.len() != self.model.dimension {
            return Err(SemanticError::DimensionMismatch {
                expected: self.model.dimension,
                got: chunk.embedding.len(),
            });
        }
        if chunk.model != self.model.model_name {
            return Err(SemanticError::ModelMismatch {
                index: self.model.model_name.clone(),
                query: chunk.model.clone(),
            });
        }
        Ok(())
    }

    /// Swap the chunk set of `path` for `chunks`. Returns how many old chunks were dropped.
    ///
    /// Every chunk is checked before anything changes; on error the index is untouched.
    pub fn replace_file(
        &mut self,
        path: &str,
        hash: String,
        chunks: Vec<DocumentChunk>,
    ) -> Result<usize> {
        for chunk in &chunks {
            self.check_chunk(chunk)?;
        }

        let pruned = self.remove_chunks_of(path);
        let chunk_ids = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        for chunk in chunks {
            self.chunks.insert(chunk.chunk_id.clone(), chunk);
        }
        self.files.insert(path.to_string(), FileEntry { hash, chunk_ids });

        Ok(pruned)
    }

    /// Drop `path` and its chunks. Returns the number of chunks removed, or `None` if unknown.
    pub fn remove_path(&mut self, path: &str) -> Option<usize> {
        if !self.files.contains_key(path) {
            return None;
        }
        let removed = self.remove_chunks_of(path);
        self.files.remove(path);
        Some(removed)
    }

    fn remove_chunks_of(&mut self, path: &str) -> usize {
        let Some(entry) = self.files.get(path) else {
            return 0;
        };
        entry
            .chunk_ids
            .iter()
            .filter(|id| self.chunks.remove(id.as_str()).is_some())
            .count()
    }

    /// Drop everything and adopt `model`. Returns the number of chunks invalidated.
    pub fn reset(&mut self, model: EmbeddingModel) -> usize {
        let invalidated = self.chunks.len();
        self.chunks.clear();
        self.files.clear();
        self.model = model;
        invalidated
    }

    /// Rank all chunks against `query` by cosine similarity, best first.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<RankedChunk>> {
        if query.len() != self.model.dimension {
            return Err(SemanticError::DimensionMismatch {
                expected: self.model.dimension,
                got: query.len(),
            });
        }

        let mut scored: Vec<(&DocumentChunk, f32)> = self
            .chunks
            .values()
            .map(|c| (c, cosine_similarity(query, &c.embedding)))
            .filter(|(_, score)| *score >= min_similarity)
            .collect();

        scored.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.source_path.cmp(&b.source_path))
                .then_with(|| a.start_line.cmp(&b.start_line))
        });
        scored.truncate(top_k);

        debug!(candidates = self.chunks.len(), returned = scored.len(), "Vector search");

        Ok(scored
            .into_iter()
            .map(|(chunk, score)| RankedChunk::from_chunk(chunk, score))
            .collect())
    }

    /// Serialize with bincode.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let data = IndexData {
            version: FORMAT_VERSION,
            model: self.model.clone(),
            chunks: self.chunks.values().cloned().collect(),
            files: self.files.clone(),
        };
        bincode::serde::encode_to_vec(&data, config::standard())
            .map_err(|e| SemanticError::Index(format!("Serialization failed: {e}")))
    }

    /// Deserialize and check every vector against the stored model.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (data, _): (IndexData, usize) =
            bincode::serde::decode_from_slice(bytes, config::standard())
                .map_err(|e| SemanticError::Index(format!("Deserialization failed: {e}")))?;

        if data.version != FORMAT_VERSION {
            return Err(SemanticError::Index(format!(
                "Unsupported index format version {}",
                data.version
            )));
        }

        let mut index = Self::new(data.model);
        for chunk in data.chunks {
            index.check_chunk(&chunk)?;
            index.chunks.insert(chunk.chunk_id.clone(), chunk);
        }
        for (path, mut entry) in data.files {
            entry.chunk_ids.retain(|id| index.chunks.contains_key(id));
            index.files.insert(path, entry);
        }
        Ok(index)
    }

    /// Write the index to `path` (temp file + rename).
    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.encode()?;
        write_index_file(path, bytes).await?;
        info!(
            path = %path.display(),
            chunks = self.chunks.len(),
            files = self.files.len(),
            "Index saved"
        );
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).await?;
        let index = Self::decode(&bytes)?;
        info!(
            path = %path.display(),
            chunks = index.len(),
            model = %index.model,
            "Index loaded"
        );
        Ok(index)
    }
}

pub(crate) async fn write_index_file(path: &Path, bytes: Vec<u8>) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, bytes).await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}
