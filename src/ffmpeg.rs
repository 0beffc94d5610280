//! ffmpeg backed trimming/transcoding and metadata tagging, plus the
//! dependency probe covering both external tools.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    artifact_store::{delete_file_if_exists, path_exists},
    capabilities::{
        DependencyProbe, DependencyStatus, ProgressReporter, Tagger, TransformProgress,
        TransformRequest, Transformer,
    },
    config::Config,
    error::{ExtractError, ExtractResult},
    models::OutputFormat,
    process::{probe_executable, run_streaming},
};

const TAG_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct Ffmpeg {
    program: String,
    timeout: Duration,
}

impl Ffmpeg {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.ffmpeg_path.clone(),
            timeout: config.processing_timeout,
        }
    }

    pub fn build_transform_args(request: &TransformRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-nostats".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            request.input.display().to_string(),
        ];

        if let Some(range) = request.range.filter(|r| !r.full) {
            if let Some(duration) = range.duration() {
                args.extend([
                    "-ss".to_string(),
                    range.start.to_string(),
                    "-t".to_string(),
                    duration.to_string(),
                ]);
            }
        }

        match request.spec.format {
            OutputFormat::Mp3 => args.extend(
                ["-vn", "-c:a", "libmp3lame", "-b:a", "192k"].map(String::from),
            ),
            OutputFormat::Wav => args.extend(
                ["-vn", "-c:a", "pcm_s16le", "-ar", "44100"].map(String::from),
            ),
            OutputFormat::Mp4 => args.extend(
                [
                    "-c:v", "libx264", "-c:a", "aac", "-preset", "fast", "-crf", "23",
                ]
                .map(String::from),
            ),
        }

        args.extend([
            "-avoid_negative_ts".to_string(),
            "make_zero".to_string(),
            "-threads".to_string(),
            request.spec.threads.max(1).to_string(),
            "-progress".to_string(),
            "pipe:1".to_string(),
            request.output.display().to_string(),
        ]);
        args
    }

    fn build_tag_args(
        input: &Path,
        output: &Path,
        title: Option<&str>,
        author: Option<&str>,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            input.display().to_string(),
            "-map".into(),
            "0".into(),
            "-c".into(),
            "copy".into(),
        ];
        if output.extension().and_then(|e| e.to_str()) == Some("mp3") {
            args.extend(["-id3v2_version".to_string(), "3".to_string()]);
        }
        if let Some(title) = title {
            args.extend(["-metadata".to_string(), format!("title={title}")]);
        }
        if let Some(author) = author {
            args.extend(["-metadata".to_string(), format!("artist={author}")]);
        }
        args.push(output.display().to_string());
        args
    }
}

#[async_trait]
impl Transformer for Ffmpeg {
    async fn transform(
        &self,
        request: &TransformRequest,
        progress: ProgressReporter<TransformProgress>,
        cancel: CancellationToken,
    ) -> ExtractResult<PathBuf> {
        let mut command = Command::new(&self.program);
        command.args(Self::build_transform_args(request));
        debug!(
            input = %request.input.display(),
            output = %request.output.display(),
            "Starting ffmpeg transform"
        );

        let result = run_streaming(
            command,
            &self.program,
            "transform",
            self.timeout,
            &cancel,
            |line| {
                if let Some(update) = parse_progress_line(line) {
                    progress.report(update);
                }
            },
        )
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                let _ = delete_file_if_exists(&request.output).await;
                return Err(err);
            }
        };

        if !outcome.success {
            let _ = delete_file_if_exists(&request.output).await;
            return Err(ExtractError::processing(format!(
                "ffmpeg exited with {:?}: {}",
                outcome.code, outcome.stderr_tail
            )));
        }
        if !path_exists(&request.output).await {
            return Err(ExtractError::processing("ffmpeg produced no output file"));
        }
        Ok(request.output.clone())
    }
}

#[async_trait]
impl Tagger for Ffmpeg {
    async fn tag(
        &self,
        path: &Path,
        title: Option<&str>,
        author: Option<&str>,
    ) -> ExtractResult<()> {
        let tagged = tagging_path(path);
        let mut command = Command::new(&self.program);
        command
            .args(Self::build_tag_args(path, &tagged, title, author))
            .kill_on_drop(true);

        let output = match tokio::time::timeout(TAG_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(ExtractError::MetadataTag(format!(
                    "Failed to run {}: {err}",
                    self.program
                )))
            }
            Err(_) => {
                let _ = delete_file_if_exists(&tagged).await;
                return Err(ExtractError::MetadataTag("ffmpeg tagging timed out".to_string()));
            }
        };

        if !output.status.success() {
            let _ = delete_file_if_exists(&tagged).await;
            return Err(ExtractError::MetadataTag(format!(
                "ffmpeg tagging failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tokio::fs::rename(&tagged, path).await.map_err(|err| {
            ExtractError::MetadataTag(format!("Failed to replace {}: {err}", path.display()))
        })
    }
}

fn tagging_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}.tagging.{ext}"))
}

/// Reads one `key=value` line of ffmpeg's `-progress` output.
pub fn parse_progress_line(line: &str) -> Option<TransformProgress> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // Both keys carry microseconds.
        "out_time_us" | "out_time_ms" => value
            .trim()
            .parse::<u64>()
            .ok()
            .map(|us| TransformProgress::Processed(us as f64 / 1_000_000.0)),
        "progress" if value.trim() == "end" => Some(TransformProgress::Finished),
        _ => None,
    }
}

/// Checks that both external executables respond.
#[derive(Debug, Clone)]
pub struct ToolProbe {
    ffmpeg: String,
    ytdlp: String,
}

impl ToolProbe {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            ytdlp: config.ytdlp_path.clone(),
        }
    }
}

#[async_trait]
impl DependencyProbe for ToolProbe {
    async fn available(&self) -> DependencyStatus {
        let (transformer, fetcher) = tokio::join!(
            probe_executable(&self.ffmpeg, &["-version"]),
            probe_executable(&self.ytdlp, &["--version"]),
        );
        if !transformer {
            warn!(program = %self.ffmpeg, "ffmpeg is not available");
        }
        if !fetcher {
            warn!(program = %self.ytdlp, "yt-dlp is not available");
        }
        DependencyStatus {
            fetcher,
            transformer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{capabilities::OutputSpec, timecode::ResolvedRange};

    fn request(format: OutputFormat, range: Option<ResolvedRange>) -> TransformRequest {
        TransformRequest {
            input: PathBuf::from("/w/raw.m4a"),
            output: PathBuf::from("/f/out.mp3"),
            spec: OutputSpec { format, threads: 4 },
            range,
        }
    }

    fn has_pair(args: &[String], key: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == key && w[1] == value)
    }

    #[test]
    fn snippet_args_trim_and_encode() {
        let range = ResolvedRange {
            start: 90,
            end: Some(120),
            full: false,
        };
        let args = Ffmpeg::build_transform_args(&request(OutputFormat::Mp3, Some(range)));

        assert!(has_pair(&args, "-ss", "90"));
        assert!(has_pair(&args, "-t", "30"));
        assert!(has_pair(&args, "-c:a", "libmp3lame"));
        assert!(has_pair(&args, "-threads", "4"));
        assert!(has_pair(&args, "-progress", "pipe:1"));
        assert_eq!(args.last().map(String::as_str), Some("/f/out.mp3"));
    }

    #[test]
    fn full_extraction_passes_no_trim() {
        let range = ResolvedRange {
            start: 0,
            end: Some(600),
            full: true,
        };
        let args = Ffmpeg::build_transform_args(&request(OutputFormat::Mp4, Some(range)));

        assert!(!args.iter().any(|a| a == "-ss" || a == "-t"));
        assert!(has_pair(&args, "-c:v", "libx264"));
        assert!(has_pair(&args, "-crf", "23"));
    }

    #[test]
    fn wav_uses_pcm() {
        let args = Ffmpeg::build_transform_args(&request(OutputFormat::Wav, None));
        assert!(has_pair(&args, "-c:a", "pcm_s16le"));
        assert!(has_pair(&args, "-ar", "44100"));
    }

    #[test]
    fn parses_progress_keys() {
        assert_eq!(
            parse_progress_line("out_time_us=15000000"),
            Some(TransformProgress::Processed(15.0))
        );
        assert_eq!(
            parse_progress_line("out_time_ms=1500000"),
            Some(TransformProgress::Processed(1.5))
        );
        assert_eq!(parse_progress_line("out_time_us=N/A"), None);
        assert_eq!(
            parse_progress_line("progress=end"),
            Some(TransformProgress::Finished)
        );
        assert_eq!(parse_progress_line("progress=continue"), None);
        assert_eq!(parse_progress_line("frame=10"), None);
    }

    #[test]
    fn tag_args_set_title_and_artist() {
        let args = Ffmpeg::build_tag_args(
            Path::new("/f/a.mp3"),
            Path::new("/f/a.tagging.mp3"),
            Some("Grace"),
            Some("Pastor"),
        );
        assert!(has_pair(&args, "-metadata", "title=Grace"));
        assert!(has_pair(&args, "-metadata", "artist=Pastor"));
        assert!(has_pair(&args, "-id3v2_version", "3"));
        assert!(has_pair(&args, "-c", "copy"));
    }

    #[test]
    fn tagging_path_keeps_extension() {
        assert_eq!(
            tagging_path(Path::new("/f/id_talk.mp4")),
            PathBuf::from("/f/id_talk.tagging.mp4")
        );
    }
}
