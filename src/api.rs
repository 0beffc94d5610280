use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::{
    error::{AdmissionError, ErrorClass, StoreError},
    jobs,
    models::{
        ExtractionRequest, JobAcceptedResponse, JobCancelledResponse, JobStatus, MediaKind,
        VideoInfoRequest,
    },
    sweeper, AppState,
};

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<usize>,
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response<Body> {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message.into()
            }
        })),
    )
        .into_response()
}

fn store_error_response(err: StoreError) -> Response<Body> {
    match err {
        StoreError::NotFound { .. } => {
            error_response(StatusCode::NOT_FOUND, "JOB_NOT_FOUND", "Job not found.")
        }
        StoreError::InvalidState { status } => error_response(
            StatusCode::CONFLICT,
            "INVALID_JOB_STATE",
            format!("Cannot cancel job with status: {status}"),
        ),
        StoreError::NotReady { status } => error_response(
            StatusCode::CONFLICT,
            "ARTIFACT_NOT_READY",
            format!("Job not completed. Current status: {status}"),
        ),
        StoreError::Gone => error_response(
            StatusCode::GONE,
            "ARTIFACT_MISSING",
            "File no longer available.",
        ),
    }
}

pub async fn root() -> impl IntoResponse {
    Json(json!({
        "message": "Media Snippet Extractor API",
        "version": env!("CARGO_PKG_VERSION"),
        "health": "/health",
    }))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(jobs::health(&state).await)
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(jobs::stats(&state).await)
}

pub async fn create_extraction(
    State(state): State<AppState>,
    Json(payload): Json<ExtractionRequest>,
) -> impl IntoResponse {
    match jobs::create_job(&state, payload).await {
        Ok(job_id) => {
            let response = JobAcceptedResponse {
                status_url: format!("/jobs/{job_id}"),
                download_url: format!("/download/{job_id}"),
                job_id,
                status: JobStatus::Created,
                message: "Extraction job created successfully".to_string(),
            };
            (StatusCode::ACCEPTED, Json(response)).into_response()
        }
        Err(AdmissionError::Invalid(message)) => {
            error_response(StatusCode::BAD_REQUEST, "INVALID_EXTRACTION_REQUEST", message)
        }
        Err(AdmissionError::QueueUnavailable) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "QUEUE_UNAVAILABLE",
            "Extraction queue is unavailable.",
        ),
    }
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> impl IntoResponse {
    Json(jobs::list_jobs(&state, query.limit).await)
}

pub async fn get_job(State(state): State<AppState>, Path(job_id): Path<String>) -> impl IntoResponse {
    match jobs::get_job(&state, &job_id).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(err) => store_error_response(err),
    }
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match jobs::cancel_job(&state, &job_id).await {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(JobCancelledResponse {
                job_id: snapshot.job_id,
                status: snapshot.status,
                message: "Job cancelled successfully".to_string(),
            }),
        )
            .into_response(),
        Err(err) => store_error_response(err),
    }
}

pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match jobs::delete_job(&state, &job_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "message": "Job deleted successfully" })),
        )
            .into_response(),
        Err(err) => store_error_response(err),
    }
}

pub async fn download(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    let artifact = match jobs::open_artifact(&state, &job_id).await {
        Ok(artifact) => artifact,
        Err(err) => return store_error_response(err),
    };

    let content_disposition = format!("attachment; filename=\"{}\"", artifact.filename);
    let body = Body::from_stream(ReaderStream::new(artifact.file));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, artifact.mime_type)
        .header(header::CONTENT_LENGTH, artifact.size)
        .header(header::CONTENT_DISPOSITION, content_disposition)
        .body(body)
        .unwrap_or_else(|err| {
            warn!(job_id = %job_id, "Failed to build download response: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "RESPONSE_BUILD_FAILED",
                "Failed to build download response.",
            )
        })
}

pub async fn video_info(
    State(state): State<AppState>,
    Json(payload): Json<VideoInfoRequest>,
) -> impl IntoResponse {
    match jobs::video_info(&state, &payload.url).await {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(err) => {
            warn!(url = %payload.url, "Video info lookup failed: {err:#}");
            let status = match err.class() {
                ErrorClass::DependencyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                ErrorClass::Timeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_REQUEST,
            };
            error_response(status, "VIDEO_INFO_FAILED", err.user_message(MediaKind::Video))
        }
    }
}

pub async fn cleanup(State(state): State<AppState>) -> impl IntoResponse {
    let report = sweeper::run_sweep(&state).await;
    Json(json!({
        "message": "Cleanup completed successfully",
        "files_remaining": report.files_remaining,
        "jobs_remaining": report.jobs_remaining,
        "cache_remaining": report.cache_remaining,
        "files_removed": report.files_removed,
        "jobs_removed": report.jobs_removed,
        "cache_removed": report.cache_removed,
        "timestamp": Utc::now(),
    }))
}
