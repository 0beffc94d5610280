use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file_name: String,
    pub temp_root: PathBuf,
    pub cleanup_interval: Duration,
    pub file_retention: Duration,
    pub max_files: usize,
    pub max_concurrent_jobs: usize,
    pub queue_capacity: usize,
    pub cache_enabled: bool,
    pub cache_retention: Duration,
    pub ffmpeg_threads: u32,
    pub ytdl_concurrent_fragments: u32,
    pub max_video_duration: u64,
    pub max_snippet_duration: u64,
    pub processing_timeout: Duration,
    pub fetch_timeout: Duration,
    pub metadata_timeout: Duration,
    pub ffmpeg_path: String,
    pub ytdlp_path: String,
    pub proxy_url: Option<String>,
    pub cookies_path: Option<PathBuf>,
    pub cookies_content: Option<String>,
    pub po_token: Option<String>,
    pub visitor_data: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = env_string("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = env_parse::<u16>("PORT").unwrap_or(5000);
        let bind_raw = format!(
            "{}:{port}",
            host.trim().trim_matches('"').trim_matches('\'')
        );
        let bind_addr = bind_raw.parse::<SocketAddr>().unwrap_or_else(|_| {
            warn!("Invalid HOST/PORT `{bind_raw}`, falling back to 0.0.0.0:{port}");
            SocketAddr::from(([0, 0, 0, 0], port))
        });

        let temp_root = env_string("TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("snippet-extract"));

        Ok(Self {
            bind_addr,
            log_level: env_string("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_to_file: env_flag("LOG_TO_FILE").unwrap_or(false),
            log_file_name: env_string("LOG_FILE_NAME")
                .unwrap_or_else(|| "snippet_extract_api.log".to_string()),
            temp_root,
            cleanup_interval: Duration::from_secs(
                env_parse::<u64>("CLEANUP_INTERVAL").unwrap_or(3600).max(1),
            ),
            file_retention: hours(env_parse::<u64>("FILE_RETENTION_HOURS").unwrap_or(24)),
            max_files: env_parse::<usize>("MAX_FILES").unwrap_or(100),
            max_concurrent_jobs: env_parse::<usize>("MAX_CONCURRENT_JOBS")
                .unwrap_or(3)
                .max(1),
            queue_capacity: env_parse::<usize>("QUEUE_CAPACITY").unwrap_or(128).max(1),
            cache_enabled: env_flag("CACHE_ENABLED").unwrap_or(true),
            cache_retention: hours(env_parse::<u64>("CACHE_RETENTION_HOURS").unwrap_or(6)),
            ffmpeg_threads: env_parse::<u32>("FFMPEG_THREADS").unwrap_or(4),
            ytdl_concurrent_fragments: env_parse::<u32>("YTDL_CONCURRENT_FRAGMENTS")
                .unwrap_or(8),
            max_video_duration: env_parse::<u64>("MAX_VIDEO_DURATION").unwrap_or(4 * 3600),
            max_snippet_duration: env_parse::<u64>("MAX_SNIPPET_DURATION").unwrap_or(4 * 3600),
            processing_timeout: Duration::from_secs(
                env_parse::<u64>("PROCESSING_TIMEOUT").unwrap_or(300),
            ),
            fetch_timeout: Duration::from_secs(env_parse::<u64>("FETCH_TIMEOUT").unwrap_or(1800)),
            metadata_timeout: Duration::from_secs(
                env_parse::<u64>("METADATA_TIMEOUT").unwrap_or(60),
            ),
            ffmpeg_path: env_string("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
            ytdlp_path: env_string("YTDLP_PATH").unwrap_or_else(|| "yt-dlp".to_string()),
            proxy_url: env_string("YOUTUBE_PROXY_URL"),
            cookies_path: env_string("YOUTUBE_COOKIES_PATH").map(PathBuf::from),
            cookies_content: env_string("YOUTUBE_COOKIES_CONTENT"),
            po_token: env_string("YOUTUBE_PO_TOKEN"),
            visitor_data: env_string("YOUTUBE_VISITOR_DATA"),
        })
    }

    /// Default filter directive used when `RUST_LOG` is not set.
    pub fn log_filter(&self) -> String {
        let level = self.log_level.trim().to_ascii_lowercase();
        let level = match level.as_str() {
            "warning" => "warn",
            "critical" => "error",
            other => other,
        };
        format!("snippet_extract_api={level},tower_http={level}")
    }

    /// Writes base64 cookie content to the temp root when no cookie file path
    /// was configured, so the fetcher can pass it along like a regular file.
    pub async fn materialize_cookies(&mut self) -> Result<()> {
        if self.cookies_path.is_some() {
            return Ok(());
        }
        let Some(encoded) = self.cookies_content.take() else {
            return Ok(());
        };

        let decoded = STANDARD
            .decode(encoded.trim())
            .context("YOUTUBE_COOKIES_CONTENT is not valid base64")?;
        let path = self.temp_root.join("cookies.txt");
        tokio::fs::write(&path, decoded)
            .await
            .with_context(|| format!("Failed to write cookie file {}", path.display()))?;

        info!(path = %path.display(), "Materialized cookie file from YOUTUBE_COOKIES_CONTENT");
        self.cookies_path = Some(path);
        Ok(())
    }
}

fn hours(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(3600))
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env_string(key).map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

#[cfg(test)]
impl Config {
    pub fn for_tests(temp_root: PathBuf) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_level: "debug".to_string(),
            log_to_file: false,
            log_file_name: "test.log".to_string(),
            temp_root,
            cleanup_interval: Duration::from_secs(3600),
            file_retention: hours(24),
            max_files: 100,
            max_concurrent_jobs: 2,
            queue_capacity: 16,
            cache_enabled: true,
            cache_retention: hours(6),
            ffmpeg_threads: 2,
            ytdl_concurrent_fragments: 4,
            max_video_duration: 4 * 3600,
            max_snippet_duration: 4 * 3600,
            processing_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(30),
            metadata_timeout: Duration::from_secs(5),
            ffmpeg_path: "ffmpeg".to_string(),
            ytdlp_path: "yt-dlp".to_string(),
            proxy_url: None,
            cookies_path: None,
            cookies_content: None,
            po_token: None,
            visitor_data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_filter_maps_python_style_levels() {
        let mut config = Config::for_tests(PathBuf::from("/tmp"));
        config.log_level = "WARNING".to_string();
        assert_eq!(
            config.log_filter(),
            "snippet_extract_api=warn,tower_http=warn"
        );
    }

    #[tokio::test]
    async fn cookie_content_is_decoded_into_temp_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::for_tests(dir.path().to_path_buf());
        config.cookies_content = Some(STANDARD.encode("# Netscape HTTP Cookie File\n"));

        config.materialize_cookies().await.expect("materialize");

        let path = config.cookies_path.clone().expect("cookie path set");
        let body = std::fs::read_to_string(path).expect("cookie file");
        assert!(body.starts_with("# Netscape"));
        assert!(config.cookies_content.is_none());
    }

    #[tokio::test]
    async fn explicit_cookie_path_wins_over_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::for_tests(dir.path().to_path_buf());
        config.cookies_path = Some(PathBuf::from("/etc/cookies.txt"));
        config.cookies_content = Some("not base64 at all!".to_string());

        config.materialize_cookies().await.expect("no decode attempted");
        assert_eq!(config.cookies_path, Some(PathBuf::from("/etc/cookies.txt")));
    }
}
