//! yt-dlp backed metadata resolution and raw media download.

use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    artifact_store::path_exists,
    capabilities::{FetchProgress, FetchRequest, Fetcher, MetadataResolver, ProgressReporter},
    config::Config,
    error::{ExtractError, ExtractResult},
    models::{MediaKind, VideoInfo},
    process::run_streaming,
};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const PROGRESS_MARKER: &str = "[progress]";
const VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "webm", "mkv"];

static ANSI_ESCAPES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid ansi pattern"));

#[derive(Debug, Clone)]
pub struct YtDlp {
    program: String,
    proxy_url: Option<String>,
    cookies_path: Option<PathBuf>,
    po_token: Option<String>,
    visitor_data: Option<String>,
    concurrent_fragments: u32,
    fetch_timeout: Duration,
    metadata_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    upload_date: Option<String>,
    thumbnail: Option<String>,
}

impl YtDlp {
    pub fn from_config(config: &Config) -> Self {
        if config.proxy_url.is_some() {
            info!("Using configured proxy for source requests");
        }
        Self {
            program: config.ytdlp_path.clone(),
            proxy_url: config.proxy_url.clone(),
            cookies_path: config.cookies_path.clone(),
            po_token: config.po_token.clone(),
            visitor_data: config.visitor_data.clone(),
            concurrent_fragments: config.ytdl_concurrent_fragments.max(1),
            fetch_timeout: config.fetch_timeout,
            metadata_timeout: config.metadata_timeout,
        }
    }

    fn common_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "--no-warnings",
            "--no-playlist",
            "--no-colors",
            "--no-check-certificates",
            "--force-ipv4",
            "--socket-timeout",
            "20",
            "--user-agent",
            USER_AGENT,
            "--referer",
            "https://www.youtube.com/",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push("--extractor-args".to_string());
        args.push(self.extractor_args());

        if let Some(proxy) = &self.proxy_url {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        if let Some(cookies) = &self.cookies_path {
            args.push("--cookies".to_string());
            args.push(cookies.display().to_string());
        }
        args
    }

    fn extractor_args(&self) -> String {
        let mut value = "youtube:player_client=android,web".to_string();
        if let Some(token) = &self.po_token {
            value.push_str(&format!(";po_token=web.gvs+{token}"));
        }
        if let Some(visitor) = &self.visitor_data {
            value.push_str(&format!(";visitor_data={visitor}"));
        }
        value
    }

    fn fetch_args(&self, request: &FetchRequest) -> Vec<String> {
        let mut args: Vec<String> = match request.kind {
            MediaKind::Audio => vec![
                "-f".into(),
                "bestaudio[ext=m4a]/bestaudio/best".into(),
                "--extract-audio".into(),
                "--audio-format".into(),
                "m4a".into(),
                "--audio-quality".into(),
                "192K".into(),
            ],
            MediaKind::Video => vec!["-f".into(), "best[ext=mp4]/best[height<=720]/best".into()],
        };

        args.extend([
            "--newline".to_string(),
            "--progress-template".to_string(),
            format!("download:{PROGRESS_MARKER} %(progress._percent_str)s|%(progress._eta_str)s"),
            "--concurrent-fragments".to_string(),
            self.concurrent_fragments.to_string(),
            "--retries".to_string(),
            "3".to_string(),
            "--fragment-retries".to_string(),
            "3".to_string(),
            "--buffer-size".to_string(),
            "1M".to_string(),
            "--http-chunk-size".to_string(),
            "10M".to_string(),
            "-o".to_string(),
            format!("{}.%(ext)s", request.dest_stem.display()),
        ]);
        args.extend(self.common_args());
        args.push(request.source.clone());
        args
    }
}

#[async_trait]
impl MetadataResolver for YtDlp {
    async fn resolve(&self, source: &str) -> ExtractResult<VideoInfo> {
        let mut command = Command::new(&self.program);
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .args(self.common_args())
            .arg(source)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.metadata_timeout, command.output())
            .await
            .map_err(|_| ExtractError::Timeout {
                operation: "metadata resolution",
                seconds: self.metadata_timeout.as_secs(),
            })?
            .map_err(|err| spawn_error(&self.program, err))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::upstream(format!(
                "yt-dlp metadata lookup failed: {}",
                stderr.trim()
            )));
        }

        let raw: RawInfo = serde_json::from_slice(&output.stdout)
            .map_err(|err| ExtractError::upstream(format!("Unreadable yt-dlp metadata: {err}")))?;
        Ok(raw.into_video_info())
    }
}

#[async_trait]
impl Fetcher for YtDlp {
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: ProgressReporter<FetchProgress>,
        cancel: CancellationToken,
    ) -> ExtractResult<PathBuf> {
        let mut command = Command::new(&self.program);
        command.args(self.fetch_args(request));
        debug!(source = %request.source, kind = request.kind.noun(), "Starting yt-dlp download");

        let outcome = run_streaming(
            command,
            &self.program,
            "download",
            self.fetch_timeout,
            &cancel,
            |line| {
                if let Some(update) = parse_progress_line(line) {
                    progress.report(update);
                }
            },
        )
        .await?;

        if !outcome.success {
            warn!(
                code = ?outcome.code,
                "yt-dlp download failed: {}",
                outcome.stderr_tail
            );
            return Err(ExtractError::upstream(format!(
                "yt-dlp exited with {:?}: {}",
                outcome.code, outcome.stderr_tail
            )));
        }

        let path = locate_download(&request.dest_stem, request.kind)
            .await
            .ok_or_else(|| ExtractError::upstream("yt-dlp reported success but wrote no file"))?;
        progress.report(FetchProgress::Finished);
        Ok(path)
    }
}

impl RawInfo {
    fn into_video_info(self) -> VideoInfo {
        VideoInfo {
            title: self.title.unwrap_or_else(|| "Unknown".to_string()),
            duration: self
                .duration
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(|d| d.round() as u64)
                .unwrap_or(0),
            uploader: self.uploader.unwrap_or_else(|| "Unknown".to_string()),
            upload_date: self.upload_date.unwrap_or_else(|| "Unknown".to_string()),
            thumbnail: self.thumbnail,
        }
    }
}

fn spawn_error(program: &str, err: std::io::Error) -> ExtractError {
    if err.kind() == std::io::ErrorKind::NotFound {
        ExtractError::DependencyUnavailable {
            missing: vec![program.to_string()],
        }
    } else {
        ExtractError::Unexpected(anyhow::anyhow!("Failed to run {program}: {err}"))
    }
}

async fn locate_download(stem: &Path, kind: MediaKind) -> Option<PathBuf> {
    let extensions: &[&str] = match kind {
        MediaKind::Audio => &["m4a"],
        MediaKind::Video => &VIDEO_EXTENSIONS,
    };
    for ext in extensions {
        let candidate = stem.with_extension(ext);
        if path_exists(&candidate).await {
            return Some(candidate);
        }
    }
    None
}

/// Reads one line emitted through our `--progress-template`.
pub fn parse_progress_line(line: &str) -> Option<FetchProgress> {
    let cleaned = ANSI_ESCAPES.replace_all(line, "");
    let rest = cleaned.trim().strip_prefix(PROGRESS_MARKER)?;
    let (percent_raw, eta_raw) = rest.split_once('|').unwrap_or((rest, ""));

    if let Ok(percent) = percent_raw.trim().trim_end_matches('%').trim().parse::<f64>() {
        if percent.is_finite() {
            return Some(FetchProgress::Percent(percent.clamp(0.0, 100.0)));
        }
    }

    let eta = eta_raw.trim();
    if eta.is_empty() || eta.eq_ignore_ascii_case("NA") || eta.eq_ignore_ascii_case("Unknown") {
        None
    } else {
        Some(FetchProgress::Eta(eta.to_string()))
    }
}
