//! Exponential backoff with optional multiplicative jitter.
//!
//! The delay before retry `n` (0-indexed) is
//! `min(max_delay, initial_delay * 2^n)`. With jitter enabled the capped
//! delay is scaled by a random factor in `[0.5, 1.5)` and capped again, so
//! a jittered delay never exceeds `max_delay`.

use crate::config::StepConfig;
use std::time::Duration;

/// Retry timing for a step, a persistence call, or a health probe.
///
/// # Example
///
/// ```
/// use pipeline_framework::backoff::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::persistence();
/// assert_eq!(policy.max_retries, 3);
/// assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
/// assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap for any single delay.
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl BackoffPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::from_config(&StepConfig::default())
        }
    }

    /// The policy a step runs its transformation under.
    pub fn from_config(config: &StepConfig) -> Self {
        Self {
            max_retries: config.retry_limit,
            initial_delay: config.retry_wait,
            max_delay: config.max_backoff,
            jitter: config.jitter,
        }
    }

    /// Storage writes inside the remote-call adapter: 3 retries, 200ms growing to 2s.
    pub fn persistence() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            jitter: false,
        }
    }

    /// Un-jittered delay for retry `attempt` (0-indexed).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Delay for retry `attempt` (0-indexed), jitter applied if enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.base_delay(attempt);
        if !self.jitter {
            return capped;
        }
        let scaled = capped.as_secs_f64() * (0.5 + fastrand::f64());
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&StepConfig::default())
    }
}
