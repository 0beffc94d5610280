//! In-process fakes for the tool capabilities and a harness that runs the
//! real worker, pipeline and stores against them.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    artifact_store::ensure_layout,
    capabilities::{
        Capabilities, DependencyProbe, DependencyStatus, FetchProgress, FetchRequest, Fetcher,
        MetadataResolver, ProgressReporter, Tagger, TransformProgress, TransformRequest,
        Transformer,
    },
    config::Config,
    error::{ExtractError, ExtractResult},
    models::{ExtractionRequest, JobSnapshot, MediaKind, VideoInfo},
    queue::spawn_extraction_worker,
    AppState,
};

pub const SOURCE: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

#[derive(Debug)]
pub struct FakeResolver {
    pub duration: u64,
    pub fail: bool,
}

impl Default for FakeResolver {
    fn default() -> Self {
        Self {
            duration: 3600,
            fail: false,
        }
    }
}

#[async_trait]
impl MetadataResolver for FakeResolver {
    async fn resolve(&self, _source: &str) -> ExtractResult<VideoInfo> {
        if self.fail {
            return Err(ExtractError::upstream("metadata lookup refused"));
        }
        Ok(VideoInfo {
            title: "Test Sermon".to_string(),
            duration: self.duration,
            uploader: "Test Channel".to_string(),
            upload_date: "20240101".to_string(),
            thumbnail: None,
        })
    }
}

#[derive(Debug, Default)]
pub struct FakeFetcher {
    pub calls: AtomicUsize,
    pub delay: Duration,
    pub fail: bool,
    /// Writes a `.part` file before waiting, like an interrupted download.
    pub write_partial: bool,
    /// Writes the finished file first and then waits out `delay` regardless
    /// of cancellation.
    pub ignore_cancel: bool,
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: ProgressReporter<FetchProgress>,
        cancel: CancellationToken,
    ) -> ExtractResult<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        progress.report(FetchProgress::Percent(50.0));

        let extension = match request.kind {
            MediaKind::Audio => "m4a",
            MediaKind::Video => "mp4",
        };
        let path = request.dest_stem.with_extension(extension);

        if self.ignore_cancel {
            write(&path, b"raw media").await?;
            tokio::time::sleep(self.delay).await;
            progress.report(FetchProgress::Finished);
            return Ok(path);
        }
        if self.write_partial {
            write(&request.dest_stem.with_extension(format!("{extension}.part")), b"raw").await?;
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(ExtractError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }
        if self.fail {
            return Err(ExtractError::upstream("HTTP Error 403: Forbidden"));
        }

        write(&path, b"raw media").await?;
        progress.report(FetchProgress::Finished);
        Ok(path)
    }
}

async fn write(path: &Path, bytes: &[u8]) -> ExtractResult<()> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|err| ExtractError::Unexpected(err.into()))
}

#[derive(Debug, Default)]
pub struct FakeTransformer {
    pub calls: AtomicUsize,
    pub fail: bool,
}

#[async_trait]
impl Transformer for FakeTransformer {
    async fn transform(
        &self,
        request: &TransformRequest,
        progress: ProgressReporter<TransformProgress>,
        _cancel: CancellationToken,
    ) -> ExtractResult<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ExtractError::processing("encoder exited with status 1"));
        }

        if let Some(total) = request.range.and_then(|range| range.duration()) {
            progress.report(TransformProgress::Processed(total as f64 / 2.0));
        }
        tokio::fs::write(&request.output, b"encoded media")
            .await
            .map_err(|err| ExtractError::Unexpected(err.into()))?;
        progress.report(TransformProgress::Finished);
        Ok(request.output.clone())
    }
}

#[derive(Debug, Default)]
pub struct FakeTagger {
    pub calls: AtomicUsize,
    pub fail: bool,
}

#[async_trait]
impl Tagger for FakeTagger {
    async fn tag(&self, _path: &Path, _title: Option<&str>, _author: Option<&str>) -> ExtractResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ExtractError::MetadataTag("container rejected tags".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeProbe {
    pub status: DependencyStatus,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            status: DependencyStatus {
                fetcher: true,
                transformer: true,
            },
        }
    }
}

#[async_trait]
impl DependencyProbe for FakeProbe {
    async fn available(&self) -> DependencyStatus {
        self.status
    }
}

#[derive(Debug, Default, Clone)]
pub struct Fakes {
    pub resolver: Arc<FakeResolver>,
    pub fetcher: Arc<FakeFetcher>,
    pub transformer: Arc<FakeTransformer>,
    pub tagger: Arc<FakeTagger>,
    pub probe: Arc<FakeProbe>,
}

impl Fakes {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            metadata: self.resolver.clone(),
            fetcher: self.fetcher.clone(),
            transformer: self.transformer.clone(),
            tagger: self.tagger.clone(),
            probe: self.probe.clone(),
        }
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetcher.calls.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub state: AppState,
    pub fakes: Fakes,
    _dir: TempDir,
}

/// State backed by a temp directory with the extraction worker running.
pub async fn harness(fakes: Fakes) -> Harness {
    harness_with(fakes, |_| {}).await
}

pub async fn harness_with(fakes: Fakes, tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let mut config = Config::for_tests(dir.path().to_path_buf());
    tweak(&mut config);
    ensure_layout(&config.temp_root).await.expect("layout");

    let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
    let state = AppState::new(config, fakes.capabilities(), queue_tx);
    spawn_extraction_worker(state.clone(), queue_rx);

    Harness {
        state,
        fakes,
        _dir: dir,
    }
}

pub fn snippet_request(start: &str, end: &str, format: &str) -> ExtractionRequest {
    ExtractionRequest {
        url: SOURCE.to_string(),
        start_time: Some(start.to_string()),
        end_time: Some(end.to_string()),
        output_format: format.to_string(),
        filename: None,
        topic: None,
        preacher: None,
        extract_full: false,
    }
}

/// File names currently under `<temp_root>/<subdir>`.
pub async fn dir_entries(state: &AppState, subdir: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(state.config.temp_root.join(subdir))
        .await
        .expect("read dir");
    while let Some(entry) = entries.next_entry().await.expect("dir entry") {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names
}

/// Polls until the job reaches a terminal state.
pub async fn wait_terminal(state: &AppState, job_id: &str) -> JobSnapshot {
    let poll = async {
        loop {
            if let Some(job) = state.jobs.get(job_id).await {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("job did not reach a terminal state in time")
}

/// Polls until `check` holds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let poll = async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("condition not reached in time");
}
