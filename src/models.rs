use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn noun(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp3,
    Wav,
    Mp4,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp3" => Some(Self::Mp3),
            "wav" => Some(Self::Wav),
            "mp4" => Some(Self::Mp4),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
            Self::Mp4 => "mp4",
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Mp3 | Self::Wav => MediaKind::Audio,
            Self::Mp4 => MediaKind::Video,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Wav => "audio/wav",
            Self::Mp4 => "video/mp4",
        }
    }

    /// Containers that carry embedded title/artist tags.
    pub fn supports_tags(&self) -> bool {
        matches!(self, Self::Mp3 | Self::Mp4)
    }
}

fn default_output_format() -> String {
    "mp3".to_string()
}

/// Extraction request as received from the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub url: String,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub preacher: Option<String>,
    #[serde(default)]
    pub extract_full: bool,
}

/// Normalized job parameters carried on the job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionSpec {
    pub url: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub format: OutputFormat,
    pub filename: Option<String>,
    pub title_tag: Option<String>,
    pub author_tag: Option<String>,
    pub extract_full: bool,
}

impl ExtractionRequest {
    /// Shape checks done before a job exists. Source and time semantics are
    /// left to the pipeline's validate stage.
    pub fn into_spec(self) -> Result<ExtractionSpec, ExtractError> {
        let format = OutputFormat::parse(&self.output_format).ok_or_else(|| {
            ExtractError::validation("Format must be one of: mp3, wav, mp4")
        })?;

        let start_time = non_blank(self.start_time).unwrap_or_else(|| "0:00".to_string());
        let end_time = non_blank(self.end_time);
        if !self.extract_full && end_time.is_none() {
            return Err(ExtractError::validation(
                "end_time is required unless extract_full is true",
            ));
        }

        Ok(ExtractionSpec {
            url: self.url.trim().to_string(),
            start_time,
            end_time,
            format,
            filename: non_blank(self.filename),
            title_tag: non_blank(self.topic),
            author_tag: non_blank(self.preacher),
            extract_full: self.extract_full,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: String,
    pub percent: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub file_id: Option<String>,
    pub file_size: Option<u64>,
    pub duration: Option<f64>,
    pub spec: ExtractionSpec,
}

impl JobRecord {
    pub fn new(job_id: String, spec: ExtractionSpec) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            status: JobStatus::Created,
            progress: "Job created".to_string(),
            percent: 0.0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            cancelled_at: None,
            error: None,
            file_id: None,
            file_size: None,
            duration: None,
            spec,
        }
    }

    pub fn to_snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            status: self.status,
            progress: self.progress.clone(),
            percent: self.percent,
            created_at: self.created_at,
            completed_at: self.completed_at,
            cancelled_at: self.cancelled_at,
            error: self.error.clone(),
            file_id: self.file_id.clone(),
            file_size: self.file_size,
            duration: self.duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: String,
    pub percent: f64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub file_id: Option<String>,
    pub file_size: Option<u64>,
    pub duration: Option<f64>,
}

/// What the pipeline hands to the job store when a job completes.
#[derive(Debug, Clone)]
pub struct Completion {
    pub file_id: String,
    pub file_size: u64,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub file_id: String,
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub title: String,
    pub duration: u64,
    pub uploader: String,
    pub upload_date: String,
    pub thumbnail: Option<String>,
}

impl VideoInfo {
    /// Stand-in used when the metadata source cannot be reached.
    pub fn fallback(now: DateTime<Utc>) -> Self {
        Self {
            title: format!("youtube_audio_{}", now.timestamp()),
            duration: 0,
            uploader: "Unknown".to_string(),
            upload_date: "Unknown".to_string(),
            thumbnail: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoInfoRequest {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAcceptedResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
    pub status_url: String,
    pub download_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCancelledResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub files_removed: usize,
    pub jobs_removed: usize,
    pub cache_removed: usize,
    pub files_remaining: usize,
    pub jobs_remaining: usize,
    pub cache_remaining: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub total_jobs: usize,
    pub created_jobs: usize,
    pub processing_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled_jobs: usize,
    pub stored_files: usize,
    pub cached_files: usize,
    pub concurrent_jobs_limit: usize,
    pub running_jobs: usize,
    pub cache_enabled: bool,
    pub ffmpeg_threads: u32,
    pub ytdl_concurrent_fragments: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub dependencies: std::collections::BTreeMap<String, bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(format: &str) -> ExtractionRequest {
        ExtractionRequest {
            url: " https://www.youtube.com/watch?v=abc ".to_string(),
            start_time: None,
            end_time: Some(" 0:30 ".to_string()),
            output_format: format.to_string(),
            filename: Some("  ".to_string()),
            topic: Some("Sermon".to_string()),
            preacher: None,
            extract_full: false,
        }
    }

    #[test]
    fn spec_normalizes_blank_fields() {
        let spec = request("MP3").into_spec().expect("valid");
        assert_eq!(spec.url, "https://www.youtube.com/watch?v=abc");
        assert_eq!(spec.start_time, "0:00");
        assert_eq!(spec.end_time.as_deref(), Some("0:30"));
        assert_eq!(spec.format, OutputFormat::Mp3);
        assert_eq!(spec.filename, None);
        assert_eq!(spec.title_tag.as_deref(), Some("Sermon"));
    }

    #[test]
    fn spec_rejects_unknown_format_and_missing_end() {
        assert!(matches!(
            request("flac").into_spec(),
            Err(ExtractError::Validation(_))
        ));

        let mut req = request("wav");
        req.end_time = None;
        assert!(req.clone().into_spec().is_err());

        req.extract_full = true;
        assert!(req.into_spec().is_ok());
    }

    #[test]
    fn request_defaults_to_mp3() {
        let req: ExtractionRequest =
            serde_json::from_str(r#"{"url":"https://youtu.be/x","end_time":"10"}"#)
                .expect("parse");
        assert_eq!(req.output_format, "mp3");
        assert!(!req.extract_full);
    }

    #[test]
    fn format_classes() {
        assert_eq!(OutputFormat::Wav.kind(), MediaKind::Audio);
        assert_eq!(OutputFormat::Mp4.kind(), MediaKind::Video);
        assert!(!OutputFormat::Wav.supports_tags());
        assert_eq!(OutputFormat::Mp3.mime_type(), "audio/mpeg");
    }
}
