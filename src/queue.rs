use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{pipeline, AppState};

/// Cancellation handles for jobs that are currently running.
#[derive(Debug, Clone, Default)]
pub struct RunningJobs {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl RunningJobs {
    pub fn register(&self, job_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.insert(job_id.to_string(), token.clone());
        token
    }

    /// Fires the job's token so in-flight tool processes are killed.
    /// Returns `false` when the job is not running.
    pub fn cancel(&self, job_id: &str) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        match tokens.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, job_id: &str) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.remove(job_id);
    }

    pub fn cancel_all(&self) {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        for token in tokens.values() {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Admits queued jobs in FIFO order. A job is only spawned once it holds a
/// limiter permit, so at most `max_concurrent_jobs` pipelines run at once.
pub fn spawn_extraction_worker(
    state: AppState,
    mut queue_rx: mpsc::Receiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job_id) = queue_rx.recv().await {
            let permit = match state.limiter.acquire().await {
                Ok(permit) => permit,
                Err(err) => {
                    error!("Extraction worker stopping: {err:#}");
                    break;
                }
            };

            info!(
                job_id = %job_id,
                running = state.limiter.in_use(),
                capacity = state.limiter.capacity(),
                "Worker picked extraction job"
            );
            tokio::spawn(pipeline::run_job(state.clone(), job_id, permit));
        }
        info!("Extraction queue closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_fires_registered_token() {
        let running = RunningJobs::default();
        let token = running.register("job-1");
        assert!(running.cancel("job-1"));
        assert!(token.is_cancelled());
        assert!(!running.cancel("job-2"));
    }

    #[test]
    fn finish_forgets_the_job() {
        let running = RunningJobs::default();
        running.register("job-1");
        running.register("job-2");
        running.finish("job-1");
        assert_eq!(running.len(), 1);
        assert!(!running.cancel("job-1"));
    }

    #[test]
    fn cancel_all_reaches_every_job() {
        let running = RunningJobs::default();
        let a = running.register("a");
        let b = running.register("b");
        running.cancel_all();
        assert!(a.is_cancelled() && b.is_cancelled());
    }
}
