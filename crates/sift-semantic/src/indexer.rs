//! Document indexing with incremental updates and model switching.

use crate::chunker::{ChunkDraft, LineChunker};
use crate::error::{Result, SemanticError};
use crate::index::{VectorIndex, write_index_file};
use crate::providers::EmbeddingProvider;
use crate::source::{ContentSource, FsContentSource, discover_files};
use crate::types::{ChunkId, DocumentChunk, EmbeddingModel, IndexReport, UpdateReport, Vector};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use sift_core::content_hash;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Concurrent embedding requests per document.
const DEFAULT_EMBED_CONCURRENCY: usize = 4;

/// Splits documents into chunks, embeds them and keeps the index current.
///
/// Updates to one path are serialized; different paths proceed in parallel.
/// A document's chunk set is swapped in one step, so readers see either the
/// previous version or the new one.
pub struct Indexer {
    index: Arc<RwLock<VectorIndex>>,
    provider: RwLock<Arc<dyn EmbeddingProvider>>,
    chunker: LineChunker,
    source: Arc<dyn ContentSource>,
    path_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    embed_concurrency: usize,
}

impl Indexer {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, chunker: LineChunker) -> Self {
        let index = VectorIndex::new(provider.model().clone());
        Self::with_index(provider, chunker, index)
    }

    /// Resume from an existing index. If it was built with another model it is reset.
    pub fn with_index(
        provider: Arc<dyn EmbeddingProvider>,
        chunker: LineChunker,
        mut index: VectorIndex,
    ) -> Self {
        if index.model() != provider.model() {
            let invalidated = index.reset(provider.model().clone());
            warn!(
                model = %provider.model(),
                invalidated,
                "Loaded index was built with a different model, starting empty"
            );
        }

        Self {
            index: Arc::new(RwLock::new(index)),
            provider: RwLock::new(provider),
            chunker,
            source: Arc::new(FsContentSource::default()),
            path_locks: DashMap::new(),
            embed_concurrency: DEFAULT_EMBED_CONCURRENCY,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn ContentSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_embed_concurrency(mut self, concurrency: usize) -> Self {
        self.embed_concurrency = concurrency.max(1);
        self
    }

    /// Shared handle to the index for searchers.
    pub fn index(&self) -> Arc<RwLock<VectorIndex>> {
        self.index.clone()
    }

    pub fn provider(&self) -> Arc<dyn EmbeddingProvider> {
        self.provider.read().clone()
    }

    pub fn model(&self) -> EmbeddingModel {
        self.index.read().model().clone()
    }

    async fn lock_path(&self, path: &str) -> PathGuard<'_> {
        let lock = self
            .path_locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        PathGuard {
            locks: &self.path_locks,
            path: path.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Index `content` under `path` and return the ids of its chunks.
    pub async fn index_document(&self, path: &str, content: &str) -> Result<Vec<ChunkId>> {
        Ok(self.incremental_update(path, content).await?.chunk_ids)
    }

    /// Re-index `path` if its content changed.
    ///
    /// Unchanged content makes no provider calls. Chunks whose text already
    /// has a vector in the previous version reuse it. A chunk that cannot be
    /// embedded is logged and left out; the rest of the document is indexed.
    pub async fn incremental_update(&self, path: &str, content: &str) -> Result<UpdateReport> {
        self.update_with_hash(path, content, content_hash(content)).await
    }

    async fn update_with_hash(
        &self,
        path: &str,
        content: &str,
        file_hash: String,
    ) -> Result<UpdateReport> {
        let _guard = self.lock_path(path).await;

        let provider = self.provider();
        let model = provider.model().clone();

        let reusable = {
            let index = self.index.read();
            if index.model() != &model {
                return Err(SemanticError::ModelMismatch {
                    index: index.model().model_name.clone(),
                    query: model.model_name.clone(),
                });
            }
            if index.file_hash(path) == Some(file_hash.as_str()) {
                debug!(path, "Content unchanged, skipping");
                let chunk_ids = index
                    .file(path)
                    .map(|f| f.chunk_ids.clone())
                    .unwrap_or_default();
                return Ok(UpdateReport {
                    chunk_ids,
                    unchanged: true,
                    ..Default::default()
                });
            }
            index.vectors_by_content(path)
        };

        let drafts = self.chunker.chunk(path, content);
        let mut report = UpdateReport::default();

        let embedded: Vec<(ChunkDraft, Result<Vector>)> = stream::iter(drafts)
            .map(|draft| {
                let provider = provider.clone();
                let reused = reusable.get(&draft.content_hash).cloned();
                async move {
                    match reused {
                        Some(vector) => (draft, Ok(vector)),
                        None => {
                            let result = embed_checked(provider.as_ref(), &draft.content).await;
                            (draft, result)
                        }
                    }
                }
            })
            .buffered(self.embed_concurrency)
            .collect()
            .await;

        let mut chunks = Vec::with_capacity(embedded.len());
        for (draft, result) in embedded {
            let reused = reusable.contains_key(&draft.content_hash);
            match result {
                Ok(embedding) => {
                    if reused {
                        report.reused += 1;
                    } else {
                        report.embedded += 1;
                    }
                    chunks.push(DocumentChunk {
                        chunk_id: draft.chunk_id,
                        source_path: path.to_string(),
                        start_line: draft.start_line,
                        end_line: draft.end_line,
                        content: draft.content,
                        content_hash: draft.content_hash,
                        embedding,
                        model: model.model_name.clone(),
                    });
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        path,
                        start_line = draft.start_line,
                        end_line = draft.end_line,
                        code = e.code(),
                        error = %e,
                        "Chunk left unindexed"
                    );
                }
            }
        }

        // An empty hash makes the next update retry the failed chunks.
        let stored_hash = if report.failed > 0 { String::new() } else { file_hash };
        report.chunk_ids = chunks.iter().map(|c| c.chunk_id.clone()).collect();

        {
            let mut index = self.index.write();
            if index.model() != &model {
                return Err(SemanticError::ModelMismatch {
                    index: index.model().model_name.clone(),
                    query: model.model_name.clone(),
                });
            }
            report.pruned = index.replace_file(path, stored_hash, chunks)?;
        }

        debug!(
            path,
            embedded = report.embedded,
            reused = report.reused,
            failed = report.failed,
            pruned = report.pruned,
            "Document indexed"
        );
        Ok(report)
    }

    /// Drop `path` from the index. Returns whether it was indexed.
    pub async fn remove_document(&self, path: &str) -> bool {
        let _guard = self.lock_path(path).await;
        self.index.write().remove_path(path).is_some()
    }

    /// Index every text file under `root` and drop indexed files that vanished.
    pub async fn index_directory(&self, root: &Path) -> Result<IndexReport> {
        let root_buf = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || discover_files(&root_buf))
            .await
            .map_err(|e| SemanticError::Index(format!("Directory walk failed: {e}")))?;

        info!(root = %root.display(), files = files.len(), "Indexing directory");

        let mut report = IndexReport {
            files_seen: files.len(),
            ..Default::default()
        };
        let mut seen = HashSet::with_capacity(files.len());

        for file in &files {
            let key = path_key(file);
            seen.insert(key.clone());

            let source = match self.source.read(file).await {
                Ok(source) => source,
                Err(e) => {
                    report.files_failed += 1;
                    warn!(path = %key, error = %e, "Skipping unreadable file");
                    continue;
                }
            };

            match self
                .update_with_hash(&key, &source.content, source.hash)
                .await
            {
                Ok(update) => report.add(&update),
                Err(e @ SemanticError::ModelMismatch { .. }) => return Err(e),
                Err(e) => {
                    report.files_failed += 1;
                    warn!(path = %key, error = %e, "Failed to index file");
                }
            }
        }

        let vanished: Vec<String> = self
            .index
            .read()
            .paths()
            .into_iter()
            .filter(|p| Path::new(p).starts_with(root) && !seen.contains(p))
            .collect();
        for path in vanished {
            if self.remove_document(&path).await {
                report.files_removed += 1;
            }
        }

        info!(
            indexed = report.files_indexed,
            unchanged = report.files_unchanged,
            removed = report.files_removed,
            failed = report.files_failed,
            chunks_embedded = report.chunks_embedded,
            "Directory indexed"
        );
        Ok(report)
    }

    /// Switch to a new embedding model. The whole index is dropped in one step
    /// and every document must be indexed again. Returns the number of chunks invalidated.
    pub fn switch_model(&self, provider: Arc<dyn EmbeddingProvider>) -> usize {
        let mut index = self.index.write();
        let mut current = self.provider.write();

        let from = index.model().clone();
        let to = provider.model().clone();
        let invalidated = index.reset(to.clone());
        *current = provider;

        warn!(
            from = %from,
            to = %to,
            invalidated,
            "Embedding model switched, index invalidated"
        );
        invalidated
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let (bytes, chunks) = {
            let index = self.index.read();
            (index.encode()?, index.len())
        };
        write_index_file(path, bytes).await?;
        info!(path = %path.display(), chunks, "Index saved");
        Ok(())
    }

    /// Load an index from `path`, or start empty when it does not exist.
    pub async fn load_or_new(
        provider: Arc<dyn EmbeddingProvider>,
        chunker: LineChunker,
        path: &Path,
    ) -> Result<Self> {
        let index = if tokio::fs::try_exists(path).await? {
            VectorIndex::load(path).await?
        } else {
            VectorIndex::new(provider.model().clone())
        };
        Ok(Self::with_index(provider, chunker, index))
    }
}

async fn embed_checked(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vector> {
    let vector = provider.embed(text).await?;
    if vector.len() != provider.dimension() {
        return Err(SemanticError::DimensionMismatch {
            expected: provider.dimension(),
            got: vector.len(),
        });
    }
    Ok(vector)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Holds a path's update lock; the map entry goes away with the last holder.
struct PathGuard<'a> {
    locks: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    path: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.path, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;

    fn indexer(size: usize, overlap: usize) -> Indexer {
        Indexer::new(
            Arc::new(MockProvider::new(32)),
            LineChunker::new(size, overlap).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_index_document_returns_chunk_ids() {
        let indexer = indexer(2, 0);
        let ids = indexer
            .index_document("a.txt", "alpha\nbeta\ngamma")
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(indexer.index().read().len(), 2);
    }

    #[tokio::test]
    async fn test_edit_reuses_unchanged_chunks() {
        let indexer = indexer(2, 0);
        indexer
            .incremental_update("a.txt", "one\ntwo\nthree\nfour")
            .await
            .unwrap();

        let report = indexer
            .incremental_update("a.txt", "one\ntwo\nthree\nFOUR")
            .await
            .unwrap();
        assert_eq!(report.reused, 1);
        assert_eq!(report.embedded, 1);
        assert_eq!(report.pruned, 2);
        assert_eq!(indexer.index().read().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_document() {
        let indexer = indexer(5, 1);
        indexer.index_document("a.txt", "text").await.unwrap();
        assert!(indexer.remove_document("a.txt").await);
        assert!(!indexer.remove_document("a.txt").await);
        assert!(indexer.index().read().is_empty());
    }

    #[tokio::test]
    async fn test_path_locks_are_released() {
        let indexer = Arc::new(indexer(2, 0));
        let updates: Vec<_> = (0..8)
            .map(|i| {
                let indexer = indexer.clone();
                tokio::spawn(async move {
                    indexer
                        .incremental_update("a.txt", &format!("one\ntwo\nversion {i}"))
                        .await
                })
            })
            .collect();
        for update in updates {
            update.await.unwrap().unwrap();
        }
        indexer.index_document("b.txt", "text").await.unwrap();
        assert!(indexer.path_locks.is_empty());

        assert!(indexer.remove_document("a.txt").await);
        assert!(indexer.path_locks.is_empty());
        assert_eq!(indexer.index().read().file_count(), 1);
    }

    #[tokio::test]
    async fn test_with_index_resets_foreign_model() {
        let old = indexer(5, 1);
        old.index_document("a.txt", "text").await.unwrap();
        let snapshot = old.index().read().clone();

        let resumed = Indexer::with_index(
            Arc::new(MockProvider::with_model("other", 16)),
            LineChunker::new(5, 1).unwrap(),
            snapshot,
        );
        assert!(resumed.index().read().is_empty());
        assert_eq!(resumed.model().dimension, 16);
    }
}
