use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds how many pipelines run at once. Tokio's semaphore hands out permits
/// in FIFO order, so waiting jobs are admitted in arrival order.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_use: Arc<AtomicUsize>,
}

/// One unit of capacity. Released on drop, whatever path the pipeline exits by.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    in_use: Arc<AtomicUsize>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn acquire(&self) -> Result<LimiterPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("Concurrency limiter closed")?;
        self.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(LimiterPermit {
            _permit: permit,
            in_use: self.in_use.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }
}
