//! The retry loop shared by steps, persistence writes and health probes.

use crate::backoff::BackoffPolicy;
use crate::error::Result;
use crate::events::{self, Event};
use crate::exec_ctx::ExecCtx;
use crate::PipelineError;
use std::future::Future;
use tracing::warn;

/// The last failure of a retry loop and how many attempts were made.
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub error: PipelineError,
}

/// Run `op` until it succeeds, fails with an error `retryable` rejects, or
/// `policy.max_retries` retries are spent.
///
/// `op` receives the 0-indexed attempt number. Cancellation and the
/// deadline are checked before every attempt and after every backoff
/// sleep; each attempt is bounded by the context deadline.
pub async fn retry_with_backoff<T, F, Fut, R>(
    ctx: &ExecCtx,
    name: &str,
    policy: &BackoffPolicy,
    retryable: R,
    mut op: F,
) -> std::result::Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    R: Fn(&PipelineError) -> bool,
{
    let mut attempt = 0u32;
    loop {
        if let Err(error) = ctx.check_cancelled() {
            return Err(RetryExhausted { attempts: attempt, error });
        }

        match ctx.bounded(op(attempt)).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if attempt > policy.max_retries || !retryable(&error) {
                    return Err(RetryExhausted { attempts: attempt, error });
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                let reason = error.to_string();
                warn!(
                    step = %name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "attempt failed, retrying"
                );
                events::emit(
                    &ctx.event_handler,
                    Event::Retry {
                        name: name.to_string(),
                        attempt,
                        delay,
                        reason,
                    },
                );

                tokio::time::sleep(delay).await;

                // Check cancellation after sleep
                if let Err(error) = ctx.check_cancelled() {
                    return Err(RetryExhausted { attempts: attempt, error });
                }
            }
        }
    }
}
