//! Bounded worker pool shared by the scheduled loops.
//!
//! Concurrency is capped by a semaphore whose permit count is the pool's
//! floor. The heartbeat monitor raises the floor, in fixed steps up to a
//! hard maximum, when it sees every permit taken while the engine is stale.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Semaphore-bounded pool with a growable floor.
#[derive(Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    floor: AtomicUsize,
    step: usize,
    max: usize,
}

impl WorkerPool {
    /// Create a pool with `floor` permits that may grow by `step` up to `max`.
    #[must_use]
    pub fn new(floor: usize, step: usize, max: usize) -> Self {
        let floor = floor.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(floor)),
            floor: AtomicUsize::new(floor),
            step: step.max(1),
            max: max.max(floor),
        }
    }

    /// Current permit count.
    #[must_use]
    pub fn floor(&self) -> usize {
        self.floor.load(Ordering::SeqCst)
    }

    /// Permits not currently held.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Whether every permit is held.
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Wait for a permit.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.semaphore).acquire_owned().await
    }

    /// Spawn `fut` once a permit is available. The permit is held until the
    /// task finishes.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                warn!("Worker pool closed, task dropped");
                return None;
            };
            Some(fut.await)
        })
    }

    /// Raise the floor by one step. Returns the new floor, or `None` at the
    /// maximum.
    pub fn raise_floor(&self) -> Option<usize> {
        let current = self.floor();
        let raised = (current + self.step).min(self.max);
        if raised <= current {
            warn!(floor = current, max = self.max, "Worker floor already at maximum");
            return None;
        }
        self.semaphore.add_permits(raised - current);
        self.floor.store(raised, Ordering::SeqCst);
        info!(from = current, to = raised, "Worker floor raised");
        Some(raised)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_saturation_and_raise() {
        let pool = WorkerPool::new(2, 2, 5);
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert!(pool.is_saturated());

        assert_eq!(pool.raise_floor(), Some(4));
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.raise_floor(), Some(5));
        assert_eq!(pool.raise_floor(), None);

        drop(a);
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn test_spawn_runs_under_permit() {
        let pool = WorkerPool::new(1, 1, 1);
        let handle = pool.spawn(async { 7 });
        assert_eq!(handle.await.unwrap(), Some(7));
        assert_eq!(pool.available(), 1);
    }
}
