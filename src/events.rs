//! Event system for step lifecycle hooks.
//!
//! Provides an optional, non-intrusive way to observe step execution.
//! Steps emit events when an invocation starts and ends, before each retry,
//! when an item is dead-lettered or dropped, when a batch window closes, and
//! when the remote-call adapter persists input. Implement [`EventHandler`]
//! to feed progress displays, counters or test assertions.

use std::sync::Arc;
use std::time::Duration;

/// Why a batch window closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `batch_size` items accumulated.
    Size,
    /// `batch_timeout` elapsed since the batch's first item.
    Timeout,
    /// Upstream finished with a partial batch pending.
    End,
}

/// Events emitted during step execution.
#[derive(Debug, Clone)]
pub enum Event {
    /// A step invocation (one item or one batch) has started.
    StepStart {
        /// Instance name of the step.
        name: String,
        /// Stable variant identifier (e.g. `"one-to-one"`, `"many-to-one"`).
        kind: &'static str,
    },
    /// A step invocation has finished.
    StepEnd {
        name: String,
        /// Whether the invocation produced a value (dead-lettered counts as not ok).
        ok: bool,
    },
    /// A retry attempt is about to run.
    Retry {
        name: String,
        /// The retry attempt number (1-indexed).
        attempt: u32,
        /// Delay slept before this attempt.
        delay: Duration,
        /// The failure that triggered the retry.
        reason: String,
    },
    /// An item or batch was routed to the dead-letter sink.
    DeadLettered {
        name: String,
        /// Attempts made before giving up.
        attempts: u32,
        reason: String,
    },
    /// A batch window closed and was handed to the transformation.
    BatchClosed {
        name: String,
        size: usize,
        reason: CloseReason,
    },
    /// The drop strategy discarded an item because the buffer was full.
    ItemDropped {
        name: String,
        /// Total drops for this step so far.
        total: u64,
    },
    /// The remote-call adapter persisted input before invoking its service.
    Persisted {
        name: String,
        /// Number of records written in this scope.
        count: usize,
    },
}

/// Handler for step lifecycle events.
///
/// This is entirely optional -- steps work without an event handler.
///
/// # Example
///
/// ```
/// use pipeline_framework::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::StepStart { name, .. } => println!("[start] {}", name),
///             Event::StepEnd { name, ok } => println!("[end] {} ok={}", name, ok),
///             Event::Retry { name, attempt, .. } => println!("[retry] {} #{}", name, attempt),
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    /// Called when a step emits an event.
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use pipeline_framework::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::DeadLettered { name, reason, .. } = event {
///         eprintln!("{} gave up: {}", name, reason);
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}

/// Records every event; used by tests and demos to inspect a run.
#[derive(Debug, Default)]
pub struct EventLog {
    events: std::sync::Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Count events matching `pred`.
    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| pred(e))
            .count()
    }
}

impl EventHandler for EventLog {
    fn on_event(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}
