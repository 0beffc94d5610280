//! In-memory stores shared between the API, the pipeline and the sweeper.
//!
//! Every mutation happens under the store's write lock and returns owned data,
//! so callers never iterate a map while it changes and never hold a lock
//! across filesystem I/O.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex as StdMutex},
};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};

use crate::{
    artifact_store::delete_file_if_exists,
    error::StoreError,
    models::{
        CacheEntry, Completion, ExtractionSpec, FileRecord, JobRecord, JobSnapshot, JobStatus,
    },
};

#[derive(Debug, Clone, Default)]
pub struct JobStore {
    jobs: Arc<RwLock<HashMap<String, JobRecord>>>,
}

impl JobStore {
    pub async fn insert(&self, record: JobRecord) {
        let mut jobs = self.jobs.write().await;
        jobs.insert(record.job_id.clone(), record);
    }

    pub async fn get(&self, job_id: &str) -> Option<JobSnapshot> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).map(JobRecord::to_snapshot)
    }

    pub async fn status(&self, job_id: &str) -> Option<JobStatus> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).map(|job| job.status)
    }

    /// Most recent jobs first.
    pub async fn list(&self, limit: usize) -> Vec<JobSnapshot> {
        let jobs = self.jobs.read().await;
        let mut snapshots: Vec<JobSnapshot> = jobs.values().map(JobRecord::to_snapshot).collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots.truncate(limit);
        snapshots
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn count_by_status(&self) -> HashMap<JobStatus, usize> {
        let jobs = self.jobs.read().await;
        let mut counts = HashMap::new();
        for job in jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        counts
    }

    /// `created -> processing`. Returns the job parameters for the pipeline.
    pub async fn begin_processing(&self, job_id: &str) -> Result<ExtractionSpec, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(job_id).ok_or_else(StoreError::job_not_found)?;
        if job.status != JobStatus::Created {
            return Err(StoreError::InvalidState { status: job.status });
        }

        job.status = JobStatus::Processing;
        job.progress = "Starting...".to_string();
        job.updated_at = Utc::now();
        Ok(job.spec.clone())
    }

    /// Records progress for a processing job.
    ///
    /// Percent never moves backwards. Returns `Ok(false)` once the job has
    /// left `processing`, which the pipeline reads as "stop here".
    pub async fn advance(
        &self,
        job_id: &str,
        percent: Option<f64>,
        message: impl Into<String>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(job_id).ok_or_else(StoreError::job_not_found)?;
        if job.status != JobStatus::Processing {
            return Ok(false);
        }

        if let Some(percent) = percent {
            job.percent = job.percent.max(percent.clamp(0.0, 100.0));
        }
        job.progress = message.into();
        job.updated_at = Utc::now();
        Ok(true)
    }

    /// `processing -> completed`, attaching the artifact reference.
    pub async fn complete(&self, job_id: &str, completion: Completion) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(job_id).ok_or_else(StoreError::job_not_found)?;
        if job.status != JobStatus::Processing {
            return Err(StoreError::InvalidState { status: job.status });
        }

        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.progress = "Extraction completed".to_string();
        job.percent = 100.0;
        job.completed_at = Some(now);
        job.updated_at = now;
        job.error = None;
        job.file_id = Some(completion.file_id);
        job.file_size = Some(completion.file_size);
        job.duration = completion.duration;
        Ok(())
    }

    /// `created | processing -> failed`. Terminal jobs are left untouched.
    pub async fn fail(&self, job_id: &str, message: impl Into<String>) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(job_id).ok_or_else(StoreError::job_not_found)?;
        if job.status.is_terminal() {
            return Err(StoreError::InvalidState { status: job.status });
        }

        let message = message.into();
        let now = Utc::now();
        job.status = JobStatus::Failed;
        job.progress = "Extraction failed".to_string();
        job.error = Some(message);
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    /// `created | processing -> cancelled`. Percent stays where it was.
    pub async fn cancel(&self, job_id: &str) -> Result<JobSnapshot, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(job_id).ok_or_else(StoreError::job_not_found)?;
        if job.status.is_terminal() {
            return Err(StoreError::InvalidState { status: job.status });
        }

        let now = Utc::now();
        job.status = JobStatus::Cancelled;
        job.progress = "Cancelled by user".to_string();
        job.cancelled_at = Some(now);
        job.updated_at = now;
        Ok(job.to_snapshot())
    }

    pub async fn remove(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.write().await.remove(job_id)
    }

    pub async fn created_times(&self) -> Vec<(String, DateTime<Utc>)> {
        let jobs = self.jobs.read().await;
        jobs.values()
            .map(|job| (job.job_id.clone(), job.created_at))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileStore {
    files: Arc<RwLock<HashMap<String, FileRecord>>>,
}

impl FileStore {
    pub async fn insert(&self, record: FileRecord) {
        let mut files = self.files.write().await;
        files.insert(record.file_id.clone(), record);
    }

    pub async fn get(&self, file_id: &str) -> Option<FileRecord> {
        self.files.read().await.get(file_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<FileRecord> {
        self.files.read().await.values().cloned().collect()
    }

    /// Removes the entry and then its backing file. Returns `false` when the
    /// entry was already gone. File removal errors are logged, not returned.
    pub async fn delete(&self, file_id: &str) -> bool {
        let removed = self.files.write().await.remove(file_id);
        let Some(record) = removed else {
            return false;
        };

        remove_backing_file(&record.path, "artifact").await;
        info!(file_id = %file_id, path = %record.path.display(), "Artifact removed");
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStore {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    fetch_locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl CacheStore {
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn insert(&self, entry: CacheEntry) {
        let mut entries = self.entries.write().await;
        entries.insert(entry.key.clone(), entry);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<CacheEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Removes the entry only if it is still the one the caller inspected,
    /// then deletes its file. A concurrent refresh under the same key wins.
    pub async fn evict(&self, expected: &CacheEntry) -> bool {
        let removed = {
            let mut entries = self.entries.write().await;
            match entries.get(&expected.key) {
                Some(current)
                    if current.path == expected.path
                        && current.created_at == expected.created_at =>
                {
                    entries.remove(&expected.key)
                }
                _ => None,
            }
        };
        let Some(entry) = removed else {
            return false;
        };

        remove_backing_file(&entry.path, "cache").await;
        true
    }

    /// Per-key guard serializing fetches of the same source.
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .fetch_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drops fetch locks nobody holds or waits on.
    pub fn prune_idle_locks(&self) -> usize {
        let mut locks = self
            .fetch_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }
}

async fn remove_backing_file(path: &Path, what: &str) {
    if let Err(err) = delete_file_if_exists(path).await {
        warn!("Failed to delete {what} file {}: {err:#}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::models::OutputFormat;

    fn spec() -> ExtractionSpec {
        ExtractionSpec {
            url: "https://www.youtube.com/watch?v=abc".to_string(),
            start_time: "0:00".to_string(),
            end_time: Some("0:30".to_string()),
            format: OutputFormat::Mp3,
            filename: None,
            title_tag: None,
            author_tag: None,
            extract_full: false,
        }
    }

    async fn store_with(job_id: &str) -> JobStore {
        let store = JobStore::default();
        store
            .insert(JobRecord::new(job_id.to_string(), spec()))
            .await;
        store
    }

    #[tokio::test]
    async fn percent_never_moves_backwards() {
        let store = store_with("j1").await;
        store.begin_processing("j1").await.expect("begin");

        assert!(store.advance("j1", Some(40.0), "a").await.expect("advance"));
        assert!(store.advance("j1", Some(20.0), "b").await.expect("advance"));
        let job = store.get("j1").await.expect("job");
        assert_eq!(job.percent, 40.0);
        assert_eq!(job.progress, "b");
    }

    #[tokio::test]
    async fn terminal_states_are_final() {
        let store = store_with("j1").await;
        store.begin_processing("j1").await.expect("begin");
        store.advance("j1", Some(50.0), "half").await.expect("advance");
        let cancelled = store.cancel("j1").await.expect("cancel");
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.percent, 50.0);

        assert!(!store.advance("j1", Some(90.0), "late").await.expect("advance"));
        assert_eq!(
            store.fail("j1", "boom").await,
            Err(StoreError::InvalidState {
                status: JobStatus::Cancelled
            })
        );
        let completion = Completion {
            file_id: "f1".to_string(),
            file_size: 1,
            duration: Some(30.0),
        };
        assert!(store.complete("j1", completion).await.is_err());

        let job = store.get("j1").await.expect("job");
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.percent, 50.0);
        assert!(job.file_id.is_none());
    }

    #[tokio::test]
    async fn cancel_is_accepted_only_before_terminal() {
        let store = store_with("created").await;
        assert!(store.cancel("created").await.is_ok());
        assert!(store.cancel("created").await.is_err());

        store
            .insert(JobRecord::new("done".to_string(), spec()))
            .await;
        store.begin_processing("done").await.expect("begin");
        store
            .complete(
                "done",
                Completion {
                    file_id: "f".to_string(),
                    file_size: 3,
                    duration: Some(30.0),
                },
            )
            .await
            .expect("complete");
        assert_eq!(
            store.cancel("done").await,
            Err(StoreError::InvalidState {
                status: JobStatus::Completed
            })
        );
        assert_eq!(store.cancel("missing").await, Err(StoreError::job_not_found()));
    }

    #[tokio::test]
    async fn failed_job_cannot_be_cancelled() {
        let store = store_with("j1").await;
        store.begin_processing("j1").await.expect("begin");
        store.fail("j1", "Failed to process the audio file.").await.expect("fail");

        assert_eq!(
            store.cancel("j1").await,
            Err(StoreError::InvalidState {
                status: JobStatus::Failed
            })
        );
        let job = store.get("j1").await.expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.cancelled_at.is_none());
    }

    #[tokio::test]
    async fn begin_processing_requires_created() {
        let store = store_with("j1").await;
        store.cancel("j1").await.expect("cancel");
        assert!(matches!(
            store.begin_processing("j1").await,
            Err(StoreError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn list_orders_newest_first() {
        let store = JobStore::default();
        for (i, id) in ["old", "mid", "new"].iter().enumerate() {
            let mut record = JobRecord::new(id.to_string(), spec());
            record.created_at = Utc::now() - ChronoDuration::minutes(10 - i as i64);
            store.insert(record).await;
        }

        let ids: Vec<String> = store.list(2).await.into_iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec!["new".to_string(), "mid".to_string()]);
    }

    #[tokio::test]
    async fn cache_evict_skips_replaced_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("raw.m4a");
        std::fs::write(&path, b"raw").expect("write");

        let store = CacheStore::default();
        let stale = CacheEntry {
            key: "k".to_string(),
            path: PathBuf::from("/nonexistent/old.m4a"),
            created_at: Utc::now() - ChronoDuration::hours(10),
            source: "src".to_string(),
        };
        let fresh = CacheEntry {
            path: path.clone(),
            created_at: Utc::now(),
            ..stale.clone()
        };
        store.insert(fresh.clone()).await;

        assert!(!store.evict(&stale).await);
        assert!(path.exists());
        assert!(store.evict(&fresh).await);
        assert!(!path.exists());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn idle_fetch_locks_are_pruned() {
        let store = CacheStore::default();
        let guard = store.lock_key("a").await;
        drop(store.lock_key("b").await);

        assert_eq!(store.prune_idle_locks(), 1);
        drop(guard);
        assert_eq!(store.prune_idle_locks(), 1);
    }
}
