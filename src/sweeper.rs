//! Periodic retention sweep over the job, file and cache stores.
//!
//! Each pass works from owned snapshots and mutates through the stores'
//! compare-and-remove operations, so entries that vanish mid-sweep are simply
//! skipped and no store lock is held while files are deleted.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    artifact_store::path_exists,
    cache::is_expired,
    config::Config,
    models::SweepReport,
    store::{CacheStore, FileStore, JobStore},
    AppState,
};

/// Budget for removing artifacts when the service stops.
pub const SHUTDOWN_CLEANUP_BUDGET: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub file_retention: Duration,
    pub max_files: usize,
    pub cache_retention: Duration,
}

impl RetentionPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            file_retention: config.file_retention,
            max_files: config.max_files,
            cache_retention: config.cache_retention,
        }
    }
}

/// Runs one sweep against the application stores.
pub async fn run_sweep(state: &AppState) -> SweepReport {
    let policy = RetentionPolicy::from_config(&state.config);
    sweep(&state.jobs, &state.files, &state.cache, policy, Utc::now()).await
}

pub async fn sweep(
    jobs: &JobStore,
    files: &FileStore,
    cache: &CacheStore,
    policy: RetentionPolicy,
    now: DateTime<Utc>,
) -> SweepReport {
    info!("Starting retention sweep");
    let mut report = SweepReport::default();

    // Aged or orphaned artifacts.
    let mut survivors = Vec::new();
    for record in files.snapshot().await {
        let expired = is_expired(record.created_at, policy.file_retention, now);
        if expired || !path_exists(&record.path).await {
            info!(
                file_id = %record.file_id,
                expired,
                "Evicting artifact"
            );
            if files.delete(&record.file_id).await {
                report.files_removed += 1;
            }
        } else {
            survivors.push(record);
        }
    }

    // Jobs are bounded by age only.
    for (job_id, created_at) in jobs.created_times().await {
        if is_expired(created_at, policy.file_retention, now) && jobs.remove(&job_id).await.is_some() {
            info!(job_id = %job_id, "Removed old job");
            report.jobs_removed += 1;
        }
    }

    // Cap the artifact count, oldest first.
    if survivors.len() > policy.max_files {
        survivors.sort_by_key(|record| record.created_at);
        let excess = survivors.len() - policy.max_files;
        for record in survivors.into_iter().take(excess) {
            if files.delete(&record.file_id).await {
                info!(file_id = %record.file_id, "Evicted artifact over file cap");
                report.files_removed += 1;
            }
        }
    }

    for entry in cache.snapshot().await {
        let expired = is_expired(entry.created_at, policy.cache_retention, now);
        if (expired || !path_exists(&entry.path).await) && cache.evict(&entry).await {
            info!(cache_key = %entry.key, expired, "Evicted cache entry");
            report.cache_removed += 1;
        }
    }
    let pruned = cache.prune_idle_locks();

    report.files_remaining = files.len().await;
    report.jobs_remaining = jobs.len().await;
    report.cache_remaining = cache.len().await;

    info!(
        files_removed = report.files_removed,
        jobs_removed = report.jobs_removed,
        cache_removed = report.cache_removed,
        fetch_locks_pruned = pruned,
        files_remaining = report.files_remaining,
        jobs_remaining = report.jobs_remaining,
        cache_remaining = report.cache_remaining,
        "Retention sweep completed"
    );
    report
}

/// Sweeps immediately and then every `cleanup_interval` until `shutdown`.
pub fn spawn_sweeper(state: AppState, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(state.config.cleanup_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    run_sweep(&state).await;
                }
            }
        }
        info!("Retention sweeper stopped");
    })
}

/// Deletes every stored artifact, giving up after `budget`.
pub async fn purge_artifacts(files: &FileStore, budget: Duration) -> usize {
    let purge = async {
        let mut removed = 0;
        for record in files.snapshot().await {
            if files.delete(&record.file_id).await {
                removed += 1;
            }
        }
        removed
    };

    match time::timeout(budget, purge).await {
        Ok(removed) => {
            info!(removed, "Removed stored artifacts on shutdown");
            removed
        }
        Err(_) => {
            warn!("Shutdown cleanup exceeded {}s budget", budget.as_secs());
            0
        }
    }
}
