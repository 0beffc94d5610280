//! Drives one job from `processing` to a terminal state.
//!
//! Stage order is fixed: validate, dependency check, metadata, range
//! resolution, raw media acquisition, transform, tag, finalize. Each stage
//! entry goes through [`checkpoint`], which stops the run as soon as the job
//! has been cancelled or deleted.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::{fs, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    artifact_store::{
        cache_stem, delete_file_if_exists, display_file_name, output_path, raw_stem,
        remove_stem_files, sanitize_filename,
    },
    cache::{self, cache_key},
    capabilities::{
        FetchProgress, FetchRequest, OutputSpec, ProgressReporter, TransformProgress,
        TransformRequest,
    },
    error::{ExtractError, ExtractResult, StoreError},
    limiter::LimiterPermit,
    models::{Completion, ExtractionSpec, FileRecord, MediaKind, VideoInfo},
    timecode::{resolve_range, DurationLimits, ResolvedRange},
    AppState,
};

const VALIDATE_PERCENT: f64 = 5.0;
const METADATA_PERCENT: f64 = 10.0;
const FETCH_START: f64 = 15.0;
const FETCH_END: f64 = 70.0;
const TRANSFORM_START: f64 = 75.0;
const TRANSFORM_END: f64 = 95.0;
const TITLE_CHARS_FOR_NAME: usize = 50;
const YOUTUBE_HOSTS: [&str; 4] = ["youtube.com", "www.youtube.com", "youtu.be", "m.youtube.com"];

/// Raw media handed from acquisition to transform.
#[derive(Debug)]
struct RawMedia {
    path: PathBuf,
    /// Cache-owned files outlive the job and are never deleted here.
    cache_owned: bool,
}

/// Files a run created and must remove if it does not complete.
#[derive(Debug, Default)]
struct Scratch {
    raw: Option<PathBuf>,
    output: Option<PathBuf>,
}

impl Scratch {
    async fn discard(&mut self) {
        for path in [self.raw.take(), self.output.take()].into_iter().flatten() {
            if let Err(err) = delete_file_if_exists(&path).await {
                warn!("Failed to remove intermediate file {}: {err:#}", path.display());
            }
        }
    }
}

/// Runs a dispatched job while holding `permit`; the permit is released when
/// this returns, on every path.
pub async fn run_job(state: AppState, job_id: String, permit: LimiterPermit) {
    let cancel = state.running.register(&job_id);

    let spec = match state.jobs.begin_processing(&job_id).await {
        Ok(spec) => spec,
        Err(err) => {
            info!(job_id = %job_id, "Skipping job: {err}");
            state.running.finish(&job_id);
            drop(permit);
            return;
        }
    };

    info!(
        job_id = %job_id,
        url = %spec.url,
        format = spec.format.extension(),
        extract_full = spec.extract_full,
        "Extraction job started"
    );

    let kind = spec.format.kind();
    let mut scratch = Scratch::default();
    let result = drive(&state, &job_id, &spec, &cancel, &mut scratch).await;
    if result.is_err() {
        scratch.discard().await;
    }

    match result {
        Ok(()) => {}
        Err(ExtractError::Cancelled) => {
            info!(job_id = %job_id, "Extraction stopped: job cancelled or removed");
        }
        Err(err) => {
            error!(job_id = %job_id, class = ?err.class(), "Extraction job failed: {err:#}");
            if let Err(store_err) = state.jobs.fail(&job_id, err.user_message(kind)).await {
                debug!(job_id = %job_id, "Failure not recorded: {store_err}");
            }
        }
    }

    state.running.finish(&job_id);
    drop(permit);
}

async fn drive(
    state: &AppState,
    job_id: &str,
    spec: &ExtractionSpec,
    cancel: &CancellationToken,
    scratch: &mut Scratch,
) -> ExtractResult<()> {
    let config = &state.config;
    let kind = spec.format.kind();
    let limits = DurationLimits {
        max_snippet: config.max_snippet_duration,
        max_video: config.max_video_duration,
    };

    checkpoint(state, job_id, VALIDATE_PERCENT, "Validating inputs...").await?;
    validate_source(&spec.url)?;
    let snippet_range = if spec.extract_full {
        None
    } else {
        Some(resolve_range(spec, None, limits)?)
    };

    let deps = state.capabilities.probe.available().await;
    if !deps.all_available() {
        return Err(ExtractError::DependencyUnavailable {
            missing: deps.missing(),
        });
    }

    checkpoint(state, job_id, METADATA_PERCENT, "Getting video information...").await?;
    let (info, metadata_resolved) = match state.capabilities.metadata.resolve(&spec.url).await {
        Ok(info) => (info, true),
        Err(err) => {
            warn!(job_id = %job_id, "Metadata unavailable, continuing with defaults: {err:#}");
            (VideoInfo::fallback(Utc::now()), false)
        }
    };

    let range = match snippet_range {
        Some(range) => range,
        None => resolve_range(spec, metadata_resolved.then_some(info.duration), limits)?,
    };

    let base_name = match &spec.filename {
        Some(name) => sanitize_filename(name, Utc::now().timestamp()),
        None => {
            let title: String = info.title.chars().take(TITLE_CHARS_FOR_NAME).collect();
            sanitize_filename(&title, Utc::now().timestamp())
        }
    };
    let file_id = Uuid::new_v4().to_string();
    let display_name = display_file_name(&base_name, spec.format);
    let output = output_path(&config.temp_root, &file_id, &display_name);

    let raw = acquire_raw(state, job_id, spec, cancel, scratch).await?;

    checkpoint(
        state,
        job_id,
        TRANSFORM_START,
        format!("Processing {}...", kind.noun()),
    )
    .await?;
    scratch.output = Some(output.clone());
    transform(state, job_id, spec, &raw, &output, range, cancel).await?;

    if spec.format.supports_tags() && (spec.title_tag.is_some() || spec.author_tag.is_some()) {
        match state
            .capabilities
            .tagger
            .tag(&output, spec.title_tag.as_deref(), spec.author_tag.as_deref())
            .await
        {
            Ok(()) => info!(
                job_id = %job_id,
                title = ?spec.title_tag,
                author = ?spec.author_tag,
                "Embedded metadata tags"
            ),
            Err(err) => warn!(job_id = %job_id, "Failed to insert metadata: {err:#}"),
        }
    }

    finalize(
        state,
        job_id,
        spec,
        &info,
        metadata_resolved,
        range,
        file_id,
        display_name,
        output,
        scratch,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn finalize(
    state: &AppState,
    job_id: &str,
    spec: &ExtractionSpec,
    info: &VideoInfo,
    metadata_resolved: bool,
    range: ResolvedRange,
    file_id: String,
    display_name: String,
    output: PathBuf,
    scratch: &mut Scratch,
) -> ExtractResult<()> {
    let kind = spec.format.kind();
    let size = match fs::metadata(&output).await {
        Ok(meta) => meta.len(),
        Err(_) => {
            return Err(ExtractError::processing(format!(
                "Failed to create the {} file",
                kind.noun()
            )))
        }
    };

    if let Some(raw) = scratch.raw.take() {
        if let Err(err) = delete_file_if_exists(&raw).await {
            warn!(job_id = %job_id, "Failed to remove raw media {}: {err:#}", raw.display());
        }
    }

    let duration = if range.full {
        (metadata_resolved && info.duration > 0).then_some(info.duration as f64)
    } else {
        range.duration().map(|d| d as f64)
    };

    state
        .files
        .insert(FileRecord {
            file_id: file_id.clone(),
            path: output.clone(),
            filename: display_name,
            size,
            mime_type: spec.format.mime_type().to_string(),
            created_at: Utc::now(),
        })
        .await;
    // The file store owns the artifact from here on.
    scratch.output = None;

    let completion = Completion {
        file_id: file_id.clone(),
        file_size: size,
        duration,
    };
    match state.jobs.complete(job_id, completion).await {
        Ok(()) => {
            info!(
                job_id = %job_id,
                file_id = %file_id,
                size_bytes = size,
                output = %output.display(),
                "Extraction job completed"
            );
            Ok(())
        }
        Err(err) => {
            info!(job_id = %job_id, "Discarding finished artifact: {err}");
            state.files.delete(&file_id).await;
            Err(ExtractError::Cancelled)
        }
    }
}

async fn acquire_raw(
    state: &AppState,
    job_id: &str,
    spec: &ExtractionSpec,
    cancel: &CancellationToken,
    scratch: &mut Scratch,
) -> ExtractResult<RawMedia> {
    let config = &state.config;
    let kind = spec.format.kind();

    if kind == MediaKind::Video || !config.cache_enabled {
        let stem = raw_stem(&config.temp_root, job_id, kind);
        let path = fetch(state, job_id, &spec.url, kind, stem, cancel).await?;
        scratch.raw = Some(path.clone());
        return Ok(RawMedia {
            path,
            cache_owned: false,
        });
    }

    let key = cache_key(&spec.url);
    // Concurrent jobs for the same source wait here and then hit the cache.
    let _fetch_guard = tokio::select! {
        _ = cancel.cancelled() => return Err(ExtractError::Cancelled),
        guard = state.cache.lock_key(&key) => guard,
    };

    if let Some(entry) = cache::lookup(&state.cache, &key, config.cache_retention).await {
        checkpoint(state, job_id, FETCH_END, "Using cached audio...").await?;
        info!(job_id = %job_id, cache_key = %key, "Using cached audio");
        return Ok(RawMedia {
            path: entry.path,
            cache_owned: true,
        });
    }

    let stem = cache_stem(&config.temp_root, &key);
    let path = fetch(state, job_id, &spec.url, kind, stem, cancel).await?;
    cache::record(&state.cache, &key, path.clone(), &spec.url).await;
    Ok(RawMedia {
        path,
        cache_owned: true,
    })
}

async fn fetch(
    state: &AppState,
    job_id: &str,
    source: &str,
    kind: MediaKind,
    dest_stem: PathBuf,
    cancel: &CancellationToken,
) -> ExtractResult<PathBuf> {
    checkpoint(
        state,
        job_id,
        FETCH_START,
        format!("Downloading {}...", kind.noun()),
    )
    .await?;

    let (tx, mut rx) = mpsc::channel::<FetchProgress>(64);
    let jobs = state.jobs.clone();
    let id = job_id.to_string();
    let forwarder = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            let (percent, message) = fetch_band(&update, kind);
            let _ = jobs.advance(&id, percent, message).await;
        }
    });

    let request = FetchRequest {
        source: source.to_string(),
        kind,
        dest_stem,
    };
    let result = state
        .capabilities
        .fetcher
        .fetch(&request, ProgressReporter::new(tx), cancel.clone())
        .await;
    let _ = forwarder.await;

    let result = match result {
        Ok(path) => checkpoint(state, job_id, FETCH_END, "Download completed, processing...")
            .await
            .map(|_| path),
        Err(err) => Err(err),
    };
    // Cache fetches still hold their key lock here, so the stem is ours alone.
    if result.is_err() {
        match remove_stem_files(&request.dest_stem).await {
            Ok(0) => {}
            Ok(removed) => debug!(job_id = %job_id, removed, "Removed unfinished download files"),
            Err(err) => warn!(job_id = %job_id, "Failed to remove unfinished download: {err:#}"),
        }
    }
    result
}

async fn transform(
    state: &AppState,
    job_id: &str,
    spec: &ExtractionSpec,
    raw: &RawMedia,
    output: &Path,
    range: ResolvedRange,
    cancel: &CancellationToken,
) -> ExtractResult<()> {
    let kind = spec.format.kind();
    let total = range.duration().filter(|d| *d > 0).map(|d| d as f64);

    let (tx, mut rx) = mpsc::channel::<TransformProgress>(64);
    let jobs = state.jobs.clone();
    let id = job_id.to_string();
    let forwarder = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            let (percent, message) = transform_band(&update, total, kind);
            let _ = jobs.advance(&id, percent, message).await;
        }
    });

    let request = TransformRequest {
        input: raw.path.clone(),
        output: output.to_path_buf(),
        spec: OutputSpec {
            format: spec.format,
            threads: state.config.ffmpeg_threads,
        },
        range: (!range.full).then_some(range),
    };
    let result = state
        .capabilities
        .transformer
        .transform(&request, ProgressReporter::new(tx), cancel.clone())
        .await;
    let _ = forwarder.await;

    result.map(|_| ())
}

/// Advances the job to a stage checkpoint, or reports that it must stop.
async fn checkpoint(
    state: &AppState,
    job_id: &str,
    percent: f64,
    message: impl Into<String>,
) -> ExtractResult<()> {
    let message = message.into();
    match state.jobs.advance(job_id, Some(percent), message.clone()).await {
        Ok(true) => {
            info!(job_id = %job_id, percent, message = %message, "Extraction progress update");
            Ok(())
        }
        Ok(false) | Err(StoreError::NotFound { .. }) => Err(ExtractError::Cancelled),
        Err(err) => Err(ExtractError::Unexpected(err.into())),
    }
}

fn validate_source(raw: &str) -> ExtractResult<()> {
    let invalid = || ExtractError::validation("Please enter a valid video URL");
    let url = Url::parse(raw).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid());
    }
    let host = url.host_str().ok_or_else(invalid)?.to_ascii_lowercase();
    if !YOUTUBE_HOSTS.iter().any(|known| host == *known) {
        warn!(url = %raw, "URL may not be a YouTube URL");
    }
    Ok(())
}

/// Maps fetcher progress into the 15-70% band.
pub fn fetch_band(update: &FetchProgress, kind: MediaKind) -> (Option<f64>, String) {
    let noun = kind.noun();
    match update {
        FetchProgress::Percent(p) => {
            let percent = (FETCH_START + p * (FETCH_END - FETCH_START) / 100.0).min(FETCH_END);
            (Some(percent), format!("Downloading {noun}... {p:.1}%"))
        }
        FetchProgress::Eta(eta) => (None, format!("Downloading {noun}... ETA: {eta}")),
        FetchProgress::Finished => (
            Some(FETCH_END),
            "Download completed, processing...".to_string(),
        ),
    }
}

/// Maps transform progress into the 75-95% band against the expected output
/// length; without one only the message moves.
pub fn transform_band(
    update: &TransformProgress,
    total_secs: Option<f64>,
    kind: MediaKind,
) -> (Option<f64>, String) {
    let noun = kind.noun();
    match (update, total_secs) {
        (TransformProgress::Processed(done), Some(total)) => {
            let ratio = (done / total * 100.0).clamp(0.0, 100.0);
            let percent =
                (TRANSFORM_START + ratio * (TRANSFORM_END - TRANSFORM_START) / 100.0).min(TRANSFORM_END);
            (Some(percent), format!("Processing {noun}... {ratio:.1}%"))
        }
        (TransformProgress::Finished, Some(_)) => {
            (Some(TRANSFORM_END), format!("Processing {noun}... 100.0%"))
        }
        (_, None) => (None, format!("Processing {noun}...")),
    }
}
