//! Command implementations for the `sift` binary.
//!
//! Each command has a `run_*` function that does the work and returns a
//! serializable summary, and a thin wrapper that prints it.

use crate::config::SiftConfig;
use crate::output::{self, OutputFormat, TableBuilder};
use anyhow::{Context, Result, bail};
use serde::Serialize;
use sift_mining::{JobSpec, JobStatusReport, JsonlResultStore, MiningEngine};
use sift_semantic::{
    ContextBundle, EmbeddingCache, IndexReport, Indexer, LineChunker, RankedChunk, SemanticSearch,
    VectorIndex, create_provider,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Outcome of `sift mine`.
#[derive(Debug, Clone, Serialize)]
pub struct MineSummary {
    pub report: JobStatusReport,
    pub results_path: PathBuf,
    pub elapsed_ms: u64,
    pub interrupted: bool,
}

/// Outcome of `sift index`.
#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub root: PathBuf,
    pub index_path: PathBuf,
    pub model: String,
    pub chunks: usize,
    pub report: IndexReport,
    pub elapsed_ms: u64,
}

/// Read a job description from a TOML file.
pub fn load_job_spec(path: &Path) -> Result<JobSpec> {
    sift_core::config::load_toml(path)
        .with_context(|| format!("Failed to load job file {}", path.display()))
}

/// Run one mining job to completion.
pub async fn run_mine(
    mut config: SiftConfig,
    job_path: &Path,
    workers: Option<usize>,
    results: Option<PathBuf>,
    format: OutputFormat,
) -> Result<MineSummary> {
    let spec = load_job_spec(job_path)?;

    if let Some(workers) = workers {
        config.mining.workers = workers;
    }
    if config.mining.cache_snapshot_path.is_none() {
        config.mining.cache_snapshot_path = Some(config.general.data_dir.join("url_cache.json"));
    }

    let results_dir = results.unwrap_or_else(|| config.results_dir());
    let store = JsonlResultStore::open(&results_dir)
        .await
        .with_context(|| format!("Failed to open result store at {}", results_dir.display()))?;
    let results_path = store.results_path();

    let started = Instant::now();
    let engine = MiningEngine::builder(config.mining.clone())
        .store(Arc::new(store))
        .start()
        .await
        .context("Failed to start mining engine")?;

    let job_id = engine.submit(spec).await.context("Job rejected")?;
    let spinner = output::spinner(format!("Mining job {job_id}"), format);

    let mut interrupted = false;
    let report = tokio::select! {
        report = engine.wait_for_terminal(job_id) => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!(%job_id, "Interrupted, stopping job");
            interrupted = true;
            engine.stop_job(job_id).await?;
            engine.get_status(job_id)?
        }
    };
    spinner.finish_and_clear();

    engine.shutdown().await.context("Mining engine did not shut down cleanly")?;

    Ok(MineSummary {
        report,
        results_path,
        elapsed_ms: started.elapsed().as_millis() as u64,
        interrupted,
    })
}

pub async fn mine(
    config: SiftConfig,
    job_path: &Path,
    workers: Option<usize>,
    results: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let summary = run_mine(config, job_path, workers, results, format).await?;

    if format.is_json() {
        return output::json(&summary);
    }

    let report = &summary.report;
    let progress = &report.progress;
    output::header(format!("Job {}", report.job_id));
    output::kv("Subject", &report.subject);
    output::kv("Status", report.status);
    output::kv("URLs", format!("{}/{}", progress.urls_done, progress.urls_total));
    output::kv("Tasks", format!("{}/{}", progress.tasks_done, progress.tasks_total));
    output::kv("Succeeded", progress.succeeded);
    output::kv("Failed", progress.failed);
    output::kv("Skipped (fresh)", progress.skipped_fresh);
    output::kv("Results", summary.results_path.display());
    output::kv(
        "Elapsed",
        output::format_duration(Duration::from_millis(summary.elapsed_ms)),
    );
    if let Some(failure) = &report.failure {
        output::error(failure);
    } else if summary.interrupted {
        output::warning("Job stopped before completion");
    } else if progress.failed > 0 {
        output::warning(format!("Completed with {} failed tasks", progress.failed));
    } else {
        output::success("Job completed");
    }
    Ok(())
}

/// Incrementally index a directory and save the index.
pub async fn run_index(
    config: &SiftConfig,
    root: &Path,
    index_path: Option<PathBuf>,
) -> Result<IndexSummary> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Cannot index {}", root.display()))?;
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    let index_path = index_path.unwrap_or_else(|| config.index_path());

    let provider = create_provider(&config.semantic.embedding)?;
    let chunker = LineChunker::from_config(&config.semantic.chunking)?;
    let indexer = Indexer::load_or_new(provider, chunker, &index_path)
        .await
        .with_context(|| format!("Failed to open index {}", index_path.display()))?;

    let started = Instant::now();
    let report = indexer.index_directory(&root).await?;
    indexer
        .save(&index_path)
        .await
        .with_context(|| format!("Failed to save index {}", index_path.display()))?;

    let index = indexer.index();
    let (model, chunks) = {
        let index = index.read();
        (index.model().to_string(), index.len())
    };
    info!(root = %root.display(), chunks, "Index updated");

    Ok(IndexSummary {
        root,
        index_path,
        model,
        chunks,
        report,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

pub async fn index(
    config: SiftConfig,
    root: &Path,
    index_path: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let spinner = output::spinner(format!("Indexing {}", root.display()), format);
    let result = run_index(&config, root, index_path).await;
    spinner.finish_and_clear();
    let summary = result?;

    if format.is_json() {
        return output::json(&summary);
    }

    let report = &summary.report;
    output::header(format!("Indexed {}", summary.root.display()));
    output::kv("Model", &summary.model);
    output::kv("Files seen", report.files_seen);
    output::kv("Files indexed", report.files_indexed);
    output::kv("Files unchanged", report.files_unchanged);
    output::kv("Files removed", report.files_removed);
    output::kv("Chunks embedded", report.chunks_embedded);
    output::kv("Chunks reused", report.chunks_reused);
    output::kv("Chunks in index", summary.chunks);
    output::kv(
        "Elapsed",
        output::format_duration(Duration::from_millis(summary.elapsed_ms)),
    );
    if report.files_failed > 0 || report.chunks_failed > 0 {
        output::warning(format!(
            "{} files and {} chunks could not be indexed",
            report.files_failed, report.chunks_failed
        ));
    } else {
        output::success(format!("Index saved to {}", summary.index_path.display()));
    }
    Ok(())
}

/// Open the saved index for querying. A model mismatch surfaces on first query.
pub async fn open_search(
    config: &SiftConfig,
    index_path: Option<PathBuf>,
) -> Result<SemanticSearch> {
    let index_path = index_path.unwrap_or_else(|| config.index_path());
    if !tokio::fs::try_exists(&index_path).await? {
        bail!(
            "No index at {}; run `sift index <dir>` first",
            index_path.display()
        );
    }

    let index = VectorIndex::load(&index_path)
        .await
        .with_context(|| format!("Failed to load index {}", index_path.display()))?;
    let provider = create_provider(&config.semantic.embedding)?;

    Ok(SemanticSearch::from_index(index, provider)
        .with_cache(EmbeddingCache::from_config(&config.semantic.cache))
        .with_config(config.semantic.search.clone()))
}

pub async fn run_search(
    config: &SiftConfig,
    query: &str,
    top_k: Option<usize>,
    min_similarity: Option<f32>,
    index_path: Option<PathBuf>,
) -> Result<Vec<RankedChunk>> {
    let search = open_search(config, index_path).await?;
    let top_k = top_k.unwrap_or(search.config().default_top_k);
    let min_similarity = min_similarity.unwrap_or(search.config().default_min_similarity);

    search
        .search(query, top_k, min_similarity)
        .await
        .map_err(|e| anyhow::anyhow!("[{}] {}", e.code(), e))
}

pub async fn search(
    config: SiftConfig,
    query: &str,
    top_k: Option<usize>,
    min_similarity: Option<f32>,
    index_path: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let results = run_search(&config, query, top_k, min_similarity, index_path).await?;

    if format.is_json() {
        return output::json(&results);
    }
    if results.is_empty() {
        output::warning("No matching chunks");
        return Ok(());
    }

    let mut table = TableBuilder::new().header(["#", "Location", "Score", "Preview"]);
    for (rank, hit) in results.iter().enumerate() {
        table = table.row([
            (rank + 1).to_string(),
            format!("{}:{}-{}", hit.source_path, hit.start_line, hit.end_line),
            format!("{:.3}", hit.similarity),
            output::preview(&hit.content, 60),
        ]);
    }
    table.print();
    Ok(())
}

pub async fn run_context(
    config: &SiftConfig,
    query: &str,
    max_tokens: usize,
    index_path: Option<PathBuf>,
) -> Result<ContextBundle> {
    let search = open_search(config, index_path).await?;
    search
        .assemble_context(query, max_tokens)
        .await
        .map_err(|e| anyhow::anyhow!("[{}] {}", e.code(), e))
}

pub async fn context(
    config: SiftConfig,
    query: &str,
    max_tokens: usize,
    index_path: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let bundle = run_context(&config, query, max_tokens, index_path).await?;

    if format.is_json() {
        return output::json(&bundle);
    }

    println!("{}", bundle.render());
    eprintln!(
        "\n{} chunks, ~{} of {} tokens",
        bundle.chunks.len(),
        bundle.token_estimate,
        max_tokens
    );
    Ok(())
}

/// Print the effective configuration.
pub fn show_config(config: &SiftConfig, format: OutputFormat) -> Result<()> {
    if format.is_json() {
        output::json(config)
    } else {
        print!("{}", config.to_toml()?);
        Ok(())
    }
}
