//! Execution context shared across step invocations.
//!
//! [`ExecCtx`] carries the cancellation flag, an optional deadline, the
//! optional event handler and the blocking worker pool. It is built once per
//! run and cloned into every stream stage; all fields are reference-counted.

use crate::error::Result;
use crate::events::EventHandler;
use crate::worker_pool::BlockingPool;
use crate::PipelineError;
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::time::Instant;

/// Shared execution context for step invocations.
///
/// # Example
///
/// ```
/// use pipeline_framework::ExecCtx;
/// use std::sync::{atomic::AtomicBool, Arc};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cancel = Arc::new(AtomicBool::new(false));
/// let ctx = ExecCtx::builder()
///     .cancellation(Some(cancel.clone()))
///     .timeout(Duration::from_secs(30))
///     .build();
/// assert!(ctx.check_cancelled().is_ok());
/// # }
/// ```
#[derive(Clone)]
pub struct ExecCtx {
    /// Optional cancellation flag; checked before every attempt and between items.
    pub cancellation: Option<Arc<AtomicBool>>,
    /// Optional point in time after which the run fails with `DeadlineExceeded`.
    pub deadline: Option<Instant>,
    /// Optional event handler for lifecycle events.
    pub event_handler: Option<Arc<dyn EventHandler>>,
    /// Pool for blocking work.
    pub pool: BlockingPool,
}

impl ExecCtx {
    /// Create a new builder.
    pub fn builder() -> ExecCtxBuilder {
        ExecCtxBuilder {
            cancellation: None,
            deadline: None,
            timeout: None,
            event_handler: None,
            pool: None,
        }
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// Request cancellation, if a flag is attached.
    pub fn cancel(&self) {
        if let Some(ref flag) = self.cancellation {
            flag.store(true, Ordering::Relaxed);
        }
    }

    /// Return an error if cancellation was requested or the deadline passed.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(PipelineError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Run `fut`, failing with `DeadlineExceeded` if the deadline passes first.
    pub async fn bounded<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .unwrap_or(Err(PipelineError::DeadlineExceeded)),
            None => fut.await,
        }
    }
}

impl Default for ExecCtx {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl std::fmt::Debug for ExecCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecCtx")
            .field("has_cancellation", &self.cancellation.is_some())
            .field("deadline", &self.deadline)
            .field("has_event_handler", &self.event_handler.is_some())
            .field("pool", &self.pool)
            .finish()
    }
}

/// Builder for [`ExecCtx`].
pub struct ExecCtxBuilder {
    cancellation: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    event_handler: Option<Arc<dyn EventHandler>>,
    pool: Option<BlockingPool>,
}

impl ExecCtxBuilder {
    /// Set the cancellation flag.
    pub fn cancellation(mut self, cancel: Option<Arc<AtomicBool>>) -> Self {
        self.cancellation = cancel;
        self
    }

    /// Fail the run once `deadline` has passed.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to `build()`. Ignored if an absolute deadline is set.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the event handler.
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Set the blocking pool. Default: one slot per available CPU.
    pub fn pool(mut self, pool: BlockingPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Build the execution context.
    pub fn build(self) -> ExecCtx {
        let deadline = self
            .deadline
            .or_else(|| self.timeout.map(|t| Instant::now() + t));
        ExecCtx {
            cancellation: self.cancellation,
            deadline,
            event_handler: self.event_handler,
            pool: self.pool.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = ExecCtx::builder().cancellation(Some(flag.clone())).build();
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancel();
        assert!(flag.load(Ordering::Relaxed));
        assert!(matches!(ctx.check_cancelled(), Err(PipelineError::Cancelled)));
    }

    #[test]
    fn test_cancel_without_flag_is_noop() {
        let ctx = ExecCtx::default();
        ctx.cancel();
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let ctx = ExecCtx::builder().timeout(Duration::from_millis(100)).build();
        assert!(ctx.check_cancelled().is_ok());

        let slow = ctx
            .bounded(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        assert!(matches!(slow, Err(PipelineError::DeadlineExceeded)));
        assert!(matches!(
            ctx.check_cancelled(),
            Err(PipelineError::DeadlineExceeded)
        ));
    }

    #[tokio::test]
    async fn test_bounded_without_deadline() {
        let ctx = ExecCtx::default();
        assert_eq!(ctx.bounded(async { Ok(7) }).await.unwrap(), 7);
    }
}
