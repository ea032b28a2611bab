//! Persistence of extraction results and job snapshots.

use crate::error::{MiningError, Result};
use crate::types::MiningJob;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sift_core::JobId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// One extracted attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub job_id: JobId,
    pub url: String,
    pub attribute: String,
    pub value: Value,
    pub schema_version: String,
    pub extracted_at: DateTime<Utc>,
}

/// Where workers and the registry persist their output.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save_extraction_result(&self, record: &ExtractionRecord) -> Result<()>;

    async fn save_job_state(&self, job: &MiningJob) -> Result<()>;

    async fn load_job_state(&self, job_id: JobId) -> Result<Option<MiningJob>>;
}

/// Store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    records: RwLock<Vec<ExtractionRecord>>,
    jobs: RwLock<HashMap<JobId, MiningJob>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExtractionRecord> {
        self.records.read().clone()
    }

    pub fn records_for(&self, job_id: JobId) -> Vec<ExtractionRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn save_extraction_result(&self, record: &ExtractionRecord) -> Result<()> {
        self.records.write().push(record.clone());
        Ok(())
    }

    async fn save_job_state(&self, job: &MiningJob) -> Result<()> {
        self.jobs.write().insert(job.job_id, job.clone());
        Ok(())
    }

    async fn load_job_state(&self, job_id: JobId) -> Result<Option<MiningJob>> {
        Ok(self.jobs.read().get(&job_id).cloned())
    }
}

/// File-backed store.
///
/// Layout under the root directory:
/// - `results.jsonl`: one [`ExtractionRecord`] per line, append-only
/// - `jobs/<job_id>.json`: latest snapshot of each job
pub struct JsonlResultStore {
    root: PathBuf,
    append_lock: Mutex<()>,
}

impl JsonlResultStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("jobs")).await?;
        Ok(Self {
            root,
            append_lock: Mutex::new(()),
        })
    }

    pub fn results_path(&self) -> PathBuf {
        self.root.join("results.jsonl")
    }

    fn job_path(&self, job_id: JobId) -> PathBuf {
        self.root.join("jobs").join(format!("{job_id}.json"))
    }

    /// Read back every record, skipping lines that do not parse.
    pub async fn read_results(&self) -> Result<Vec<ExtractionRecord>> {
        read_jsonl(&self.results_path()).await
    }
}

async fn read_jsonl(path: &Path) -> Result<Vec<ExtractionRecord>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[async_trait]
impl ResultStore for JsonlResultStore {
    async fn save_extraction_result(&self, record: &ExtractionRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.append_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.results_path())
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn save_job_state(&self, job: &MiningJob) -> Result<()> {
        let path = self.job_path(job.job_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(job)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(job_id = %job.job_id, status = %job.status, "Job state saved");
        Ok(())
    }

    async fn load_job_state(&self, job_id: JobId) -> Result<Option<MiningJob>> {
        match tokio::fs::read(self.job_path(job_id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| MiningError::Store(format!("corrupt job snapshot {job_id}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttributeSpec, JobConfig, JobProgress, JobStatus};
    use serde_json::json;

    fn record(job_id: JobId, url: &str) -> ExtractionRecord {
        ExtractionRecord {
            job_id,
            url: url.to_string(),
            attribute: "title".to_string(),
            value: json!("Hello"),
            schema_version: "1.0.0".to_string(),
            extracted_at: Utc::now(),
        }
    }

    fn job(job_id: JobId) -> MiningJob {
        MiningJob {
            job_id,
            subject: "widgets".to_string(),
            seed_urls: vec!["http://a.test/".to_string()],
            attributes: vec![AttributeSpec::new("title", 1)],
            status: JobStatus::Completed,
            config: JobConfig::default(),
            progress: JobProgress::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            failure: None,
        }
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryResultStore::new();
        let a = JobId::new();
        let b = JobId::new();
        store.save_extraction_result(&record(a, "http://a.test/")).await.unwrap();
        store.save_extraction_result(&record(b, "http://b.test/")).await.unwrap();
        assert_eq!(store.records().len(), 2);
        assert_eq!(store.records_for(a).len(), 1);

        assert!(store.load_job_state(a).await.unwrap().is_none());
        store.save_job_state(&job(a)).await.unwrap();
        assert_eq!(store.load_job_state(a).await.unwrap().unwrap().job_id, a);
    }

    #[tokio::test]
    async fn test_jsonl_store_appends_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlResultStore::open(dir.path()).await.unwrap();
        let job_id = JobId::new();

        store.save_extraction_result(&record(job_id, "http://a.test/")).await.unwrap();
        store.save_extraction_result(&record(job_id, "http://a.test/2")).await.unwrap();
        let records = store.read_results().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].url, "http://a.test/2");

        store.save_job_state(&job(job_id)).await.unwrap();
        let reopened = JsonlResultStore::open(dir.path()).await.unwrap();
        let loaded = reopened.load_job_state(job_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert!(reopened.load_job_state(JobId::new()).await.unwrap().is_none());
    }
}
