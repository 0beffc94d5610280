//! Control operations exposed to the transport layer.

use chrono::Utc;
use tokio::fs::{self, File};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{AdmissionError, ExtractResult, StoreError},
    models::{
        ExtractionRequest, HealthResponse, JobRecord, JobSnapshot, JobStatus, StatsResponse,
        VideoInfo,
    },
    AppState,
};

pub const DEFAULT_LIST_LIMIT: usize = 10;
pub const MAX_LIST_LIMIT: usize = 100;

/// An artifact opened for streaming to a client.
#[derive(Debug)]
pub struct Artifact {
    pub file: File,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

/// Registers a job in `created` and queues it. Returns the new job id.
pub async fn create_job(state: &AppState, request: ExtractionRequest) -> Result<String, AdmissionError> {
    let spec = request.into_spec()?;
    let job_id = Uuid::new_v4().to_string();

    info!(
        job_id = %job_id,
        url = %spec.url,
        format = spec.format.extension(),
        start = %spec.start_time,
        end = ?spec.end_time,
        extract_full = spec.extract_full,
        "Extraction job created"
    );
    state.jobs.insert(JobRecord::new(job_id.clone(), spec)).await;

    if state.queue_tx.send(job_id.clone()).await.is_err() {
        state.jobs.remove(&job_id).await;
        return Err(AdmissionError::QueueUnavailable);
    }
    Ok(job_id)
}

pub async fn get_job(state: &AppState, job_id: &str) -> Result<JobSnapshot, StoreError> {
    state.jobs.get(job_id).await.ok_or_else(StoreError::job_not_found)
}

/// Newest first. `limit` is clamped into `1..=100`.
pub async fn list_jobs(state: &AppState, limit: Option<usize>) -> Vec<JobSnapshot> {
    let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    state.jobs.list(limit).await
}

pub async fn cancel_job(state: &AppState, job_id: &str) -> Result<JobSnapshot, StoreError> {
    let snapshot = state.jobs.cancel(job_id).await?;
    let was_running = state.running.cancel(job_id);
    info!(job_id = %job_id, was_running, "Extraction job cancelled");
    Ok(snapshot)
}

/// Removes the job record and its artifact. A running job is stopped first.
pub async fn delete_job(state: &AppState, job_id: &str) -> Result<(), StoreError> {
    let record = state.jobs.remove(job_id).await.ok_or_else(StoreError::job_not_found)?;
    state.running.cancel(job_id);

    if let Some(file_id) = &record.file_id {
        state.files.delete(file_id).await;
    }
    info!(job_id = %job_id, status = %record.status, "Extraction job deleted");
    Ok(())
}

pub async fn open_artifact(state: &AppState, job_id: &str) -> Result<Artifact, StoreError> {
    let job = state.jobs.get(job_id).await.ok_or_else(StoreError::job_not_found)?;
    if job.status != JobStatus::Completed {
        return Err(StoreError::NotReady { status: job.status });
    }

    let file_id = job.file_id.ok_or(StoreError::Gone)?;
    let record = state.files.get(&file_id).await.ok_or(StoreError::Gone)?;

    let file = match File::open(&record.path).await {
        Ok(file) => file,
        Err(err) => {
            warn!(
                job_id = %job_id,
                path = %record.path.display(),
                "Artifact missing on disk: {err}"
            );
            return Err(StoreError::Gone);
        }
    };
    let size = match fs::metadata(&record.path).await {
        Ok(meta) => meta.len(),
        Err(_) => record.size,
    };

    Ok(Artifact {
        file,
        filename: record.filename,
        mime_type: record.mime_type,
        size,
    })
}

pub async fn video_info(state: &AppState, url: &str) -> ExtractResult<VideoInfo> {
    state.capabilities.metadata.resolve(url.trim()).await
}

pub async fn stats(state: &AppState) -> StatsResponse {
    let counts = state.jobs.count_by_status().await;
    let count = |status: JobStatus| counts.get(&status).copied().unwrap_or(0);

    StatsResponse {
        total_jobs: counts.values().sum(),
        created_jobs: count(JobStatus::Created),
        processing_jobs: count(JobStatus::Processing),
        completed_jobs: count(JobStatus::Completed),
        failed_jobs: count(JobStatus::Failed),
        cancelled_jobs: count(JobStatus::Cancelled),
        stored_files: state.files.len().await,
        cached_files: state.cache.len().await,
        concurrent_jobs_limit: state.limiter.capacity(),
        running_jobs: state.limiter.in_use(),
        cache_enabled: state.config.cache_enabled,
        ffmpeg_threads: state.config.ffmpeg_threads,
        ytdl_concurrent_fragments: state.config.ytdl_concurrent_fragments,
        timestamp: Utc::now(),
    }
}

pub async fn health(state: &AppState) -> HealthResponse {
    let deps = state.capabilities.probe.available().await;
    HealthResponse {
        status: if deps.all_available() { "healthy" } else { "unhealthy" }.to_string(),
        timestamp: Utc::now(),
        dependencies: deps.to_map(),
    }
}
