//! Line-window chunking with overlap.

use crate::config::ChunkingConfig;
use crate::error::Result;
use sift_core::{composite_hash, content_hash};

/// A chunk before it is embedded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDraft {
    pub chunk_id: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub content_hash: String,
}

/// Splits text into windows of `chunk_size` lines, consecutive windows
/// sharing `overlap` lines. The final window always ends at the last line.
#[derive(Debug, Clone, Copy)]
pub struct LineChunker {
    chunk_size: usize,
    overlap: usize,
}

impl LineChunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        ChunkingConfig { chunk_size, overlap }.validate()?;
        Ok(Self { chunk_size, overlap })
    }

    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        Self::new(config.chunk_size, config.overlap)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Line ranges `(start, end)`, 1-based and inclusive, for a document of `line_count` lines.
    pub fn windows(&self, line_count: usize) -> Vec<(usize, usize)> {
        let step = self.chunk_size - self.overlap;
        let mut windows = Vec::new();
        let mut start = 1;
        while start <= line_count {
            let end = (start + self.chunk_size - 1).min(line_count);
            windows.push((start, end));
            if end == line_count {
                break;
            }
            start += step;
        }
        windows
    }

    /// Chunk `content` from `path`. Whitespace-only windows are skipped.
    pub fn chunk(&self, path: &str, content: &str) -> Vec<ChunkDraft> {
        let lines: Vec<&str> = content.lines().collect();

        self.windows(lines.len())
            .into_iter()
            .filter_map(|(start, end)| {
                let text = lines[start - 1..end].join("\n");
                if text.trim().is_empty() {
                    return None;
                }
                let hash = content_hash(&text);
                let chunk_id = composite_hash([
                    path,
                    &start.to_string(),
                    &end.to_string(),
                    hash.as_str(),
                ]);
                Some(ChunkDraft {
                    chunk_id,
                    start_line: start,
                    end_line: end,
                    content: text,
                    content_hash: hash,
                })
            })
            .collect()
    }
}
