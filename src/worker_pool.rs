//! Bounded pool for blocking work.
//!
//! Synchronous transformations (and simulated polling delays) run through
//! [`BlockingPool::run`], which holds a semaphore permit for the duration of
//! a `spawn_blocking` task. The async scheduler threads never run the
//! closure themselves.

use crate::error::Result;
use crate::PipelineError;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Cheap-to-clone handle to a bounded blocking pool.
#[derive(Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl BlockingPool {
    /// A pool running at most `size` closures at once (minimum 1).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by running work.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `f` on a blocking thread once a permit is free.
    ///
    /// A panic inside `f` surfaces as [`PipelineError::ProgrammerError`].
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::ProgrammerError("blocking pool closed".to_string()))?;
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await;
        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(PipelineError::ProgrammerError(format!(
                "blocking task panicked: {}",
                e
            ))),
            Err(_) => Err(PipelineError::Cancelled),
        }
    }
}

impl Default for BlockingPool {
    fn default() -> Self {
        let size = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(size)
    }
}

impl std::fmt::Debug for BlockingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingPool")
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}
