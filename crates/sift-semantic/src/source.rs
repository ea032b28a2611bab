//! Document sources and directory discovery.

use crate::error::{Result, SemanticError};
use async_trait::async_trait;
use sift_core::content_hash;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory names never descended into.
const IGNORE_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "dist",
    "build",
    ".git",
    ".svn",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".sift",
];

/// Files larger than this are skipped by [`FsContentSource`].
pub const DEFAULT_MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;

/// Whether the extension marks a text document worth indexing.
pub fn is_text_file(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => matches!(
            ext,
            "rs" | "py" | "js" | "jsx" | "ts" | "tsx" | "md" | "txt" | "json" | "toml" | "yaml"
                | "yml" | "html" | "css" | "scss" | "c" | "cpp" | "h" | "hpp" | "go" | "java"
                | "kt" | "swift" | "rb" | "php" | "sh" | "bash" | "zsh" | "sql" | "rst"
        ),
        None => false,
    }
}

fn is_ignored_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| IGNORE_DIRS.contains(&name))
}

/// Text files under `root`, honoring `.gitignore`, sorted.
///
/// Blocking; run it on a blocking thread from async code.
pub fn discover_files(root: &Path) -> Vec<PathBuf> {
    let walker = ignore::WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .filter_entry(|entry| !is_ignored_dir(entry.path()))
        .build();

    let mut files: Vec<PathBuf> = walker
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .map(|entry| entry.into_path())
        .filter(|path| is_text_file(path))
        .collect();

    files.sort();
    files
}

/// Document text plus its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceContent {
    pub content: String,
    pub hash: String,
}

impl SourceContent {
    pub fn new(content: String) -> Self {
        let hash = content_hash(&content);
        Self { content, hash }
    }
}

/// Where document text comes from.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn read(&self, path: &Path) -> Result<SourceContent>;
}

/// Reads UTF-8 files from the local filesystem.
#[derive(Debug, Clone)]
pub struct FsContentSource {
    max_bytes: u64,
}

impl FsContentSource {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl Default for FsContentSource {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_BYTES)
    }
}

#[async_trait]
impl ContentSource for FsContentSource {
    async fn read(&self, path: &Path) -> Result<SourceContent> {
        let metadata = tokio::fs::metadata(path).await?;
        if metadata.len() > self.max_bytes {
            return Err(SemanticError::Source {
                path: path.display().to_string(),
                reason: format!("file exceeds {} bytes", self.max_bytes),
            });
        }

        let bytes = tokio::fs::read(path).await?;
        let content = String::from_utf8(bytes).map_err(|_| SemanticError::Source {
            path: path.display().to_string(),
            reason: "not valid UTF-8".to_string(),
        })?;
        Ok(SourceContent::new(content))
    }
}
