//! Storage collaborator for the remote-call adapter.

use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Writes domain inputs before a remote step invokes its service.
///
/// Implementations must be safe to call again with the same item: the
/// adapter retries transient storage failures.
#[async_trait]
pub trait Persistence<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Store one item, returning the stored form.
    async fn persist(&self, item: T) -> Result<T>;

    /// Store a completed collection in one transactional scope.
    ///
    /// The default persists items one by one and is only as atomic as
    /// `persist`; stores with transactions should override it.
    async fn persist_all(&self, items: Vec<T>) -> Result<Vec<T>> {
        let mut stored = Vec::with_capacity(items.len());
        for item in items {
            stored.push(self.persist(item).await?);
        }
        Ok(stored)
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection closed",
    "connection reset",
    "timed out",
    "timeout",
];

/// Storage errors worth another attempt: `TransientFailure`, or any error
/// whose message reports a refused, closed or reset connection or a timeout.
pub fn is_transient_storage_error(error: &PipelineError) -> bool {
    match error.root_cause() {
        PipelineError::TransientFailure(_) => true,
        PipelineError::Cancelled | PipelineError::DeadlineExceeded => false,
        other => {
            let message = other.to_string().to_lowercase();
            TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
        }
    }
}

/// Vec-backed [`Persistence`] with failure injection.
///
/// `persist_all` is atomic: a failing call stores nothing.
///
/// ```
/// use pipeline_framework::remote::{InMemoryPersistence, Persistence};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = InMemoryPersistence::<&str>::new();
/// store.fail_next(1);
/// assert!(store.persist("a").await.is_err());
/// assert!(store.persist("a").await.is_ok());
/// assert_eq!(store.items(), vec!["a"]);
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryPersistence<T> {
    items: Mutex<Vec<T>>,
    failures: AtomicU32,
    rejection: Mutex<Option<String>>,
    calls: AtomicU32,
}

impl<T> Default for InMemoryPersistence<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            failures: AtomicU32::new(0),
            rejection: Mutex::new(None),
            calls: AtomicU32::new(0),
        }
    }
}

impl<T: Clone> InMemoryPersistence<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with a refused connection.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Fail every call with a non-transient error until cleared with `None`.
    pub fn reject(&self, message: Option<&str>) {
        *self.rejection.lock().unwrap_or_else(|p| p.into_inner()) = message.map(str::to_string);
    }

    /// Everything stored so far, in write order.
    pub fn items(&self) -> Vec<T> {
        self.items.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Calls to `persist` or `persist_all`, failed ones included.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref message) = *self.rejection.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(PipelineError::Other(message.clone()));
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PipelineError::TransientFailure("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<T> Persistence<T> for InMemoryPersistence<T>
where
    T: Clone + Send + 'static,
{
    async fn persist(&self, item: T) -> Result<T> {
        self.check()?;
        self.items
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(item.clone());
        Ok(item)
    }

    async fn persist_all(&self, items: Vec<T>) -> Result<Vec<T>> {
        self.check()?;
        self.items
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(items.iter().cloned());
        Ok(items)
    }
}
