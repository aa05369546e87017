//! The execution contract every step variant runs its transformation under:
//! null check, retry with backoff, then dead-letter or propagate.

use crate::backoff::BackoffPolicy;
use crate::config::StepConfig;
use crate::dead_letter::DeadLetterSink;
use crate::error::Result;
use crate::events::{self, Event};
use crate::exec_ctx::ExecCtx;
use crate::retry::{retry_with_backoff, RetryExhausted};
use crate::PipelineError;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a failed invocation is handed to if recovery is on.
pub(crate) enum Failed<'a> {
    Item(&'a Value),
    Batch(&'a [Value]),
}

/// Reject `Value::Null` before any attempt is made.
pub(crate) fn require_input(step: &str, item: &Value) -> Result<()> {
    if item.is_null() {
        return Err(PipelineError::NullInput {
            step: step.to_string(),
        });
    }
    Ok(())
}

/// Failures that end the run no matter what `recover_on_failure` says.
fn is_fatal(error: &PipelineError) -> bool {
    matches!(
        error.root_cause(),
        PipelineError::Cancelled
            | PipelineError::DeadlineExceeded
            | PipelineError::NullInput { .. }
            | PipelineError::InvalidConfiguration(_)
    )
}

/// Run `op` under the step's retry policy.
///
/// Returns `Ok(Some(_))` on success and `Ok(None)` when the input was
/// dead-lettered. Retryable failures that survive every attempt without
/// recovery become [`PipelineError::PermanentFailure`]; non-retryable ones
/// propagate unchanged.
pub(crate) async fn invoke<T, F, Fut>(
    ctx: &ExecCtx,
    step: &str,
    kind: &'static str,
    config: &StepConfig,
    sink: &Arc<dyn DeadLetterSink>,
    failed: Failed<'_>,
    op: F,
) -> Result<Option<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    events::emit(
        &ctx.event_handler,
        Event::StepStart {
            name: step.to_string(),
            kind,
        },
    );
    let policy = BackoffPolicy::from_config(config);
    let outcome = retry_with_backoff(ctx, step, &policy, PipelineError::is_retryable, op).await;
    let result = match outcome {
        Ok(value) => Ok(Some(value)),
        Err(exhausted) => settle(ctx, step, config, sink, failed, exhausted),
    };
    events::emit(
        &ctx.event_handler,
        Event::StepEnd {
            name: step.to_string(),
            ok: matches!(result, Ok(Some(_))),
        },
    );
    result
}

fn settle<T>(
    ctx: &ExecCtx,
    step: &str,
    config: &StepConfig,
    sink: &Arc<dyn DeadLetterSink>,
    failed: Failed<'_>,
    exhausted: RetryExhausted,
) -> Result<Option<T>> {
    let RetryExhausted { attempts, error } = exhausted;

    if is_fatal(&error) {
        return Err(error);
    }

    if config.recover_on_failure {
        match failed {
            Failed::Item(item) => sink.on_item(step, item, &error),
            Failed::Batch(batch) => sink.on_batch(step, batch, &error),
        }
        events::emit(
            &ctx.event_handler,
            Event::DeadLettered {
                name: step.to_string(),
                attempts,
                reason: error.to_string(),
            },
        );
        if config.debug {
            debug!(step = %step, attempts, "recovered by dead-lettering");
        }
        return Ok(None);
    }

    if error.is_retryable() {
        warn!(step = %step, attempts, error = %error, "retries exhausted");
        return Err(PipelineError::PermanentFailure {
            step: step.to_string(),
            attempts,
            source: Box::new(error),
        });
    }
    Err(error)
}

/// Dead-letter an error surfacing from a stream with no attributable input.
///
/// Returns the error back when the step does not recover.
pub(crate) fn recover_stream_error(
    ctx: &ExecCtx,
    step: &str,
    config: &StepConfig,
    sink: &Arc<dyn DeadLetterSink>,
    error: PipelineError,
) -> Result<()> {
    if !config.recover_on_failure || is_fatal(&error) {
        return Err(error);
    }
    sink.on_item(step, &Value::Null, &error);
    events::emit(
        &ctx.event_handler,
        Event::DeadLettered {
            name: step.to_string(),
            attempts: 1,
            reason: error.to_string(),
        },
    );
    Ok(())
}
