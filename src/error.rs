use thiserror::Error;

use crate::models::{JobStatus, MediaKind};

/// Failures raised while driving a job through the extraction pipeline.
///
/// The display text carries technical detail for logs; callers only ever see
/// [`ExtractError::user_message`].
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("missing required software: {}", missing.join(", "))]
    DependencyUnavailable { missing: Vec<String> },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("processing failed: {0}")]
    Processing(String),

    #[error("metadata tagging failed: {0}")]
    MetadataTag(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },

    #[error("cancelled by user")]
    Cancelled,

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// Coarse classification used for logging and for the job error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    DependencyUnavailable,
    UpstreamUnavailable,
    Processing,
    MetadataTag,
    Timeout,
    Cancelled,
    Network,
    Unclassified,
}

impl ExtractError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(msg.into())
    }

    pub fn processing(msg: impl Into<String>) -> Self {
        Self::Processing(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) => ErrorClass::Validation,
            Self::DependencyUnavailable { .. } => ErrorClass::DependencyUnavailable,
            Self::UpstreamUnavailable(_) => ErrorClass::UpstreamUnavailable,
            Self::Processing(_) => ErrorClass::Processing,
            Self::MetadataTag(_) => ErrorClass::MetadataTag,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::Unexpected(err) => classify_detail(&format!("{err:#}")),
        }
    }

    /// The single sentence stored on a failed job.
    pub fn user_message(&self, kind: MediaKind) -> String {
        let noun = kind.noun();
        match self.class() {
            // Validation text is written for end users at the raise site.
            ErrorClass::Validation => match self {
                Self::Validation(msg) => msg.clone(),
                _ => "The request is invalid. Please check your input.".to_string(),
            },
            ErrorClass::DependencyUnavailable => {
                "System configuration error. Please contact support.".to_string()
            }
            ErrorClass::UpstreamUnavailable => {
                "Unable to access this video. Please check the URL and try again.".to_string()
            }
            ErrorClass::Processing => format!("Failed to process the {noun} file. Please try again."),
            ErrorClass::MetadataTag => format!("Failed to add metadata to the {noun} file."),
            ErrorClass::Timeout => {
                format!("Processing took too long. Please try with a shorter {noun} snippet.")
            }
            ErrorClass::Cancelled => "Cancelled by user".to_string(),
            ErrorClass::Network => {
                "Network connection error. Please check your internet and try again.".to_string()
            }
            ErrorClass::Unclassified => "An unexpected error occurred. Please try again.".to_string(),
        }
    }
}

fn classify_detail(detail: &str) -> ErrorClass {
    let lower = detail.to_ascii_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        ErrorClass::Timeout
    } else if lower.contains("network") || lower.contains("connection") {
        ErrorClass::Network
    } else {
        ErrorClass::Unclassified
    }
}

pub type ExtractResult<T> = std::result::Result<T, ExtractError>;

/// Reasons a job could not be admitted.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("{0}")]
    Invalid(String),

    #[error("extraction queue is unavailable")]
    QueueUnavailable,
}

impl From<ExtractError> for AdmissionError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Validation(msg) => Self::Invalid(msg),
            other => Self::Invalid(other.to_string()),
        }
    }
}

/// Errors surfaced by the control operations over the stores.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("job cannot be changed in its current state ({status})")]
    InvalidState { status: JobStatus },

    #[error("artifact is not ready (job status: {status})")]
    NotReady { status: JobStatus },

    #[error("artifact no longer available")]
    Gone,
}

impl StoreError {
    pub fn job_not_found() -> Self {
        Self::NotFound { entity: "job" }
    }
}
