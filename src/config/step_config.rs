//! Execution parameters for a single step.
//!
//! [`StepConfig`] is a plain value with validated setters: every duration
//! and size must be positive, and a violating call fails with
//! [`PipelineError::InvalidConfiguration`] instead of clamping.

use crate::error::Result;
use crate::PipelineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Buffer capacity used when the configured strategy is missing or unrecognized.
pub const FALLBACK_BUFFER_CAPACITY: usize = 128;

/// What happens when downstream cannot keep up with upstream production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureStrategy {
    /// Bound the pending queue; a full queue slows the producer.
    #[default]
    Buffer,
    /// Bound the pending queue; a full queue discards the newest items.
    Drop,
}

impl BackpressureStrategy {
    /// Case-insensitive parse. Unrecognized names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "buffer" => Some(BackpressureStrategy::Buffer),
            "drop" => Some(BackpressureStrategy::Drop),
            _ => None,
        }
    }
}

/// Resolved execution parameters for one step.
///
/// # Example
///
/// ```
/// use pipeline_framework::config::StepConfig;
/// use std::time::Duration;
///
/// let config = StepConfig::default()
///     .with_retry_limit(5)
///     .with_retry_wait(Duration::from_millis(50))
///     .unwrap();
/// assert_eq!(config.retry_limit, 5);
///
/// assert!(StepConfig::default().with_batch_size(0).is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct StepConfig {
    /// Additional attempts after the first failure. Default: 3.
    pub retry_limit: u32,
    /// Base delay before the first retry. Default: 2s.
    pub retry_wait: Duration,
    /// Upper bound for any single retry delay. Default: 30s.
    pub max_backoff: Duration,
    /// Apply ±50% multiplicative jitter to retry delays. Default: false.
    pub jitter: bool,
    /// Dead-letter items that exhaust their retries instead of failing. Default: false.
    pub recover_on_failure: bool,
    /// Dispatch stream items concurrently (unordered). Default: false.
    pub parallel: bool,
    /// Default: [`BackpressureStrategy::Buffer`].
    pub backpressure_strategy: BackpressureStrategy,
    /// Pending-item bound for the backpressure queue. Default: 1024.
    pub backpressure_buffer_capacity: usize,
    /// Items per batch for many-to-one steps. Default: 10.
    pub batch_size: usize,
    /// Time from a batch's first item until it closes. Default: 1s.
    pub batch_timeout: Duration,
    /// Persist remote-call inputs before invoking the service. Default: false.
    pub auto_persist: bool,
    /// Per-item debug logging. Default: false.
    pub debug: bool,
    /// Run synchronous transformations on the blocking worker pool. Default: false.
    pub run_blocking: bool,
    /// In-flight bound for side-effect steps. Default: 1.
    pub concurrency: usize,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_wait: Duration::from_millis(2000),
            max_backoff: Duration::from_secs(30),
            jitter: false,
            recover_on_failure: false,
            parallel: false,
            backpressure_strategy: BackpressureStrategy::Buffer,
            backpressure_buffer_capacity: 1024,
            batch_size: 10,
            batch_timeout: Duration::from_millis(1000),
            auto_persist: false,
            debug: false,
            run_blocking: false,
            concurrency: 1,
        }
    }
}

pub(crate) fn positive_duration(field: &str, value: Duration) -> Result<Duration> {
    if value.is_zero() {
        return Err(PipelineError::InvalidConfiguration(format!(
            "{} must be > 0",
            field
        )));
    }
    Ok(value)
}

pub(crate) fn positive_size(field: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(PipelineError::InvalidConfiguration(format!(
            "{} must be > 0",
            field
        )));
    }
    Ok(value)
}

impl StepConfig {
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn with_retry_wait(mut self, wait: Duration) -> Result<Self> {
        self.retry_wait = positive_duration("retry_wait", wait)?;
        Ok(self)
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Result<Self> {
        self.max_backoff = positive_duration("max_backoff", max)?;
        Ok(self)
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    pub fn with_recover_on_failure(mut self, enabled: bool) -> Self {
        self.recover_on_failure = enabled;
        self
    }

    pub fn with_parallel(mut self, enabled: bool) -> Self {
        self.parallel = enabled;
        self
    }

    pub fn with_backpressure_strategy(mut self, strategy: BackpressureStrategy) -> Self {
        self.backpressure_strategy = strategy;
        self
    }

    pub fn with_backpressure_buffer_capacity(mut self, capacity: usize) -> Result<Self> {
        self.backpressure_buffer_capacity =
            positive_size("backpressure_buffer_capacity", capacity)?;
        Ok(self)
    }

    pub fn with_batch_size(mut self, size: usize) -> Result<Self> {
        self.batch_size = positive_size("batch_size", size)?;
        Ok(self)
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.batch_timeout = positive_duration("batch_timeout", timeout)?;
        Ok(self)
    }

    pub fn with_auto_persist(mut self, enabled: bool) -> Self {
        self.auto_persist = enabled;
        self
    }

    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    pub fn with_run_blocking(mut self, enabled: bool) -> Self {
        self.run_blocking = enabled;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Result<Self> {
        self.concurrency = positive_size("concurrency", concurrency)?;
        Ok(self)
    }

    /// Re-check every positivity invariant.
    ///
    /// Values built through the setters always pass; this catches configs
    /// assembled by hand through the public fields.
    pub fn validate(&self) -> Result<()> {
        positive_duration("retry_wait", self.retry_wait)?;
        positive_duration("max_backoff", self.max_backoff)?;
        positive_duration("batch_timeout", self.batch_timeout)?;
        positive_size("backpressure_buffer_capacity", self.backpressure_buffer_capacity)?;
        positive_size("batch_size", self.batch_size)?;
        positive_size("concurrency", self.concurrency)?;
        Ok(())
    }
}
