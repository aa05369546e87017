//! Last-resort handling for items whose processing permanently failed.
//!
//! A step with `recover_on_failure = true` hands each item (or batch) that
//! exhausted its retries to a [`DeadLetterSink`] and continues with the next
//! item. The default sink logs at `error` level; steps accept a per-step
//! override.

use crate::PipelineError;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::error;

/// Receives items that could not be processed.
pub trait DeadLetterSink: Send + Sync {
    /// A single item failed. `item` is `Value::Null` when the failure came
    /// out of an opaque stream transformation with no attributable input.
    fn on_item(&self, step: &str, item: &Value, error: &PipelineError);

    /// A whole batch failed. Defaults to one record for the batch.
    fn on_batch(&self, step: &str, batch: &[Value], error: &PipelineError) {
        self.on_item(step, &Value::Array(batch.to_vec()), error);
    }
}

/// Logs each failure with its cause.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDeadLetter;

impl DeadLetterSink for LoggingDeadLetter {
    fn on_item(&self, step: &str, item: &Value, err: &PipelineError) {
        error!(step = %step, item = %item, error = %err, "dead-lettered item");
    }

    fn on_batch(&self, step: &str, batch: &[Value], err: &PipelineError) {
        error!(step = %step, size = batch.len(), error = %err, "dead-lettered batch");
    }
}

/// One recorded failure.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub step: String,
    pub item: Value,
    pub reason: String,
}

/// Keeps every failure in memory, in arrival order.
#[derive(Debug, Default)]
pub struct CollectingDeadLetter {
    entries: Mutex<Vec<DeadLetter>>,
}

impl CollectingDeadLetter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for CollectingDeadLetter {
    fn on_item(&self, step: &str, item: &Value, err: &PipelineError) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(DeadLetter {
                step: step.to_string(),
                item: item.clone(),
                reason: err.to_string(),
            });
    }
}

/// The sink used when a step does not name its own.
pub fn default_sink() -> Arc<dyn DeadLetterSink> {
    Arc::new(LoggingDeadLetter)
}
