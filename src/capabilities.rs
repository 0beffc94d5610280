//! Contracts for the external tools the pipeline drives.
//!
//! The pipeline only sees these traits; `ytdlp` and `ffmpeg` provide the
//! process-backed implementations and tests plug in fakes.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::ExtractResult,
    models::{MediaKind, OutputFormat, VideoInfo},
    timecode::ResolvedRange,
};

#[derive(Debug, Clone, PartialEq)]
pub enum FetchProgress {
    /// Download completion, 0..=100.
    Percent(f64),
    /// Remaining time as reported by the fetcher, when no percentage is known.
    Eta(String),
    Finished,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformProgress {
    /// Seconds of output media written so far.
    Processed(f64),
    Finished,
}

/// Fire-and-forget progress channel handed to a capability call.
#[derive(Debug, Clone)]
pub struct ProgressReporter<T> {
    tx: mpsc::Sender<T>,
}

impl<T> ProgressReporter<T> {
    pub fn new(tx: mpsc::Sender<T>) -> Self {
        Self { tx }
    }

    /// Drops the update when the consumer lags; later updates supersede it.
    pub fn report(&self, update: T) {
        let _ = self.tx.try_send(update);
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub source: String,
    pub kind: MediaKind,
    /// Destination without extension; the fetcher picks the container.
    pub dest_stem: PathBuf,
}

#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub format: OutputFormat,
    pub threads: u32,
}

#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub spec: OutputSpec,
    /// `None` transcodes the whole input.
    pub range: Option<ResolvedRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyStatus {
    pub fetcher: bool,
    pub transformer: bool,
}

impl DependencyStatus {
    pub fn missing(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if !self.fetcher {
            missing.push("yt-dlp".to_string());
        }
        if !self.transformer {
            missing.push("ffmpeg".to_string());
        }
        missing
    }

    pub fn all_available(&self) -> bool {
        self.fetcher && self.transformer
    }

    pub fn to_map(&self) -> BTreeMap<String, bool> {
        BTreeMap::from([
            ("ffmpeg".to_string(), self.transformer),
            ("yt_dlp".to_string(), self.fetcher),
        ])
    }
}

#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self, source: &str) -> ExtractResult<VideoInfo>;
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Downloads the raw media and returns where it landed.
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: ProgressReporter<FetchProgress>,
        cancel: CancellationToken,
    ) -> ExtractResult<PathBuf>;
}

#[async_trait]
pub trait Transformer: Send + Sync {
    /// Trims and/or re-encodes `request.input` into `request.output`.
    async fn transform(
        &self,
        request: &TransformRequest,
        progress: ProgressReporter<TransformProgress>,
        cancel: CancellationToken,
    ) -> ExtractResult<PathBuf>;
}

#[async_trait]
pub trait Tagger: Send + Sync {
    async fn tag(&self, path: &Path, title: Option<&str>, author: Option<&str>)
        -> ExtractResult<()>;
}

#[async_trait]
pub trait DependencyProbe: Send + Sync {
    async fn available(&self) -> DependencyStatus;
}

/// The set of collaborators a pipeline runs against.
#[derive(Clone)]
pub struct Capabilities {
    pub metadata: Arc<dyn MetadataResolver>,
    pub fetcher: Arc<dyn Fetcher>,
    pub transformer: Arc<dyn Transformer>,
    pub tagger: Arc<dyn Tagger>,
    pub probe: Arc<dyn DependencyProbe>,
}
