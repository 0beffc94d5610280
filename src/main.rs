mod api;
mod artifact_store;
mod cache;
mod capabilities;
mod config;
mod error;
mod ffmpeg;
mod jobs;
mod limiter;
mod models;
mod pipeline;
mod process;
mod queue;
mod store;
mod sweeper;
#[cfg(test)]
mod testing;
mod timecode;
mod ytdlp;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use capabilities::Capabilities;
use config::Config;
use ffmpeg::{Ffmpeg, ToolProbe};
use limiter::ConcurrencyLimiter;
use queue::RunningJobs;
use store::{CacheStore, FileStore, JobStore};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ytdlp::YtDlp;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub jobs: JobStore,
    pub files: FileStore,
    pub cache: CacheStore,
    pub limiter: ConcurrencyLimiter,
    pub running: RunningJobs,
    pub capabilities: Capabilities,
    pub queue_tx: mpsc::Sender<String>,
}

impl AppState {
    pub fn new(config: Config, capabilities: Capabilities, queue_tx: mpsc::Sender<String>) -> Self {
        Self {
            limiter: ConcurrencyLimiter::new(config.max_concurrent_jobs),
            config: Arc::new(config),
            jobs: JobStore::default(),
            files: FileStore::default(),
            cache: CacheStore::default(),
            running: RunningJobs::default(),
            capabilities,
            queue_tx,
        }
    }
}

fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_filter().into());

    let (file_layer, guard) = if config.log_to_file {
        let appender = tracing_appender::rolling::never(".", &config.log_file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn build_capabilities(config: &Config) -> Capabilities {
    let ytdlp = Arc::new(YtDlp::from_config(config));
    let ffmpeg = Arc::new(Ffmpeg::from_config(config));
    Capabilities {
        metadata: ytdlp.clone(),
        fetcher: ytdlp,
        transformer: ffmpeg.clone(),
        tagger: ffmpeg,
        probe: Arc::new(ToolProbe::from_config(config)),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(api::root))
        .route("/health", get(api::health))
        .route("/stats", get(api::stats))
        .route("/cleanup", post(api::cleanup))
        .route("/extract", post(api::create_extraction))
        .route("/video-info", post(api::video_info))
        .route("/jobs", get(api::list_jobs))
        .route("/jobs/{job_id}", get(api::get_job).delete(api::delete_job))
        .route("/jobs/{job_id}/cancel", post(api::cancel_job))
        .route("/download/{job_id}", get(api::download))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let mut config = Config::from_env()?;
    let _log_guard = init_tracing(&config);

    artifact_store::ensure_layout(&config.temp_root).await?;
    config.materialize_cookies().await?;

    info!(
        temp_root = %config.temp_root.display(),
        max_concurrent_jobs = config.max_concurrent_jobs,
        cache_enabled = config.cache_enabled,
        ffmpeg_threads = config.ffmpeg_threads,
        ytdl_concurrent_fragments = config.ytdl_concurrent_fragments,
        "Starting snippet-extract-api"
    );

    let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
    let capabilities = build_capabilities(&config);
    let bind_addr = config.bind_addr;
    let state = AppState::new(config, capabilities, queue_tx);

    let sweeper_shutdown = CancellationToken::new();
    queue::spawn_extraction_worker(state.clone(), queue_rx);
    let sweeper_task = sweeper::spawn_sweeper(state.clone(), sweeper_shutdown.clone());

    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("snippet-extract-api listening on {bind_addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper_shutdown.cancel();
    state.running.cancel_all();
    let _ = sweeper_task.await;
    sweeper::purge_artifacts(&state.files, sweeper::SHUTDOWN_CLEANUP_BUDGET).await;
    info!("snippet-extract-api stopped");
    Ok(())
}
