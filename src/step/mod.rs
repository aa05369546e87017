//! Step variants and the closed [`Step`] enum the runner dispatches on.
//!
//! | Variant        | Input            | Output                 |
//! |----------------|------------------|------------------------|
//! | [`OneToOne`]   | one item         | one item               |
//! | [`OneToMany`]  | one item         | a sub-stream of items  |
//! | [`ManyToOne`]  | a stream         | one item per batch     |
//! | [`ManyToMany`] | a stream         | a stream               |
//! | [`SideEffect`] | one item         | the same item          |
//!
//! Every variant rejects `Value::Null` with `NullInput`, retries its
//! transformation with exponential backoff, and either dead-letters or
//! propagates the final failure depending on `recover_on_failure`.

pub(crate) mod contract;
mod many_to_many;
mod many_to_one;
mod one_to_many;
mod one_to_one;
mod side_effect;

pub use many_to_many::ManyToMany;
pub use many_to_one::{BatchOutput, ManyToOne};
pub use one_to_many::OneToMany;
pub use one_to_one::OneToOne;
pub use side_effect::SideEffect;

use crate::backpressure::{self, Backpressure, DropCounter};
use crate::config::{ConfigHandle, StepConfig};
use crate::dead_letter::{self, DeadLetterSink};
use crate::error::Result;
use crate::exec_ctx::ExecCtx;
use crate::flow::{Flow, ItemStream};
use crate::PipelineError;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// A pipeline step. The set of variants is closed, so an unsupported step
/// cannot be assembled.
#[derive(Clone)]
pub enum Step {
    OneToOne(Arc<OneToOne>),
    OneToMany(Arc<OneToMany>),
    ManyToOne(Arc<ManyToOne>),
    ManyToMany(Arc<ManyToMany>),
    SideEffect(Arc<SideEffect>),
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::OneToOne(s) => s.name(),
            Step::OneToMany(s) => s.name(),
            Step::ManyToOne(s) => s.name(),
            Step::ManyToMany(s) => s.name(),
            Step::SideEffect(s) => s.name(),
        }
    }

    /// Stable variant identifier, as carried by lifecycle events.
    pub fn kind(&self) -> &'static str {
        match self {
            Step::OneToOne(_) => one_to_one::KIND,
            Step::OneToMany(_) => one_to_many::KIND,
            Step::ManyToOne(_) => many_to_one::KIND,
            Step::ManyToMany(_) => many_to_many::KIND,
            Step::SideEffect(_) => side_effect::KIND,
        }
    }

    /// Base URL of the remote service this step calls, if any.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Step::OneToOne(s) => s.endpoint(),
            Step::OneToMany(s) => s.endpoint(),
            Step::ManyToOne(s) => s.endpoint(),
            Step::ManyToMany(s) => s.endpoint(),
            Step::SideEffect(s) => s.endpoint(),
        }
    }

    /// Items discarded by this step's drop backpressure so far.
    pub fn dropped(&self) -> u64 {
        match self {
            Step::OneToOne(s) => s.dropped(),
            Step::OneToMany(s) => s.dropped(),
            Step::ManyToOne(s) => s.dropped(),
            Step::ManyToMany(s) => s.dropped(),
            Step::SideEffect(s) => s.dropped(),
        }
    }

    /// Apply this step to `flow`, converting between single and stream
    /// shapes as the variant requires.
    pub fn apply(&self, ctx: &ExecCtx, config: &ConfigHandle, flow: Flow) -> Flow {
        match self {
            Step::OneToOne(s) => s.apply(ctx, config, flow),
            Step::OneToMany(s) => s.apply(ctx, config, flow),
            Step::ManyToOne(s) => s.apply(ctx, config, flow),
            Step::ManyToMany(s) => s.apply(ctx, config, flow),
            Step::SideEffect(s) => s.apply(ctx, config, flow),
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

macro_rules! impl_into_step {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Step {
                fn from(step: $variant) -> Self {
                    Step::$variant(Arc::new(step))
                }
            }
        )*
    };
}

impl_into_step!(OneToOne, OneToMany, ManyToOne, ManyToMany, SideEffect);

/// Identity shared by every variant: name, optional sink override,
/// optional remote endpoint, and the drop counter for its output buffer.
#[derive(Clone)]
pub(crate) struct StepMeta {
    pub name: String,
    pub dead_letter: Option<Arc<dyn DeadLetterSink>>,
    pub endpoint: Option<String>,
    pub drops: DropCounter,
}

impl StepMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dead_letter: None,
            endpoint: None,
            drops: DropCounter::new(),
        }
    }

    pub fn sink(&self) -> Arc<dyn DeadLetterSink> {
        self.dead_letter
            .clone()
            .unwrap_or_else(dead_letter::default_sink)
    }

    /// Route `items` through this step's configured backpressure buffer.
    pub fn backpressure(&self, ctx: &ExecCtx, config: &StepConfig, items: ItemStream) -> ItemStream {
        backpressure::apply(
            items,
            Backpressure {
                step: self.name.clone(),
                strategy: config.backpressure_strategy,
                capacity: config.backpressure_buffer_capacity,
                drops: self.drops.clone(),
                events: ctx.event_handler.clone(),
            },
        )
    }
}

impl std::fmt::Debug for StepMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepMeta")
            .field("name", &self.name)
            .field("has_dead_letter", &self.dead_letter.is_some())
            .field("endpoint", &self.endpoint)
            .field("dropped", &self.drops.get())
            .finish()
    }
}

/// Builder methods common to every variant.
macro_rules! step_meta_methods {
    () => {
        pub fn name(&self) -> &str {
            &self.meta.name
        }

        /// Send items that exhaust their retries here instead of the logging sink.
        pub fn with_dead_letter(mut self, sink: std::sync::Arc<dyn $crate::dead_letter::DeadLetterSink>) -> Self {
            self.meta.dead_letter = Some(sink);
            self
        }

        /// Declare the remote service this step depends on, for the health gate.
        pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
            self.meta.endpoint = Some(endpoint.into());
            self
        }

        pub fn endpoint(&self) -> Option<&str> {
            self.meta.endpoint.as_deref()
        }

        /// Items discarded by the drop backpressure strategy so far.
        pub fn dropped(&self) -> u64 {
            self.meta.drops.get()
        }
    };
}
pub(crate) use step_meta_methods;

/// Deserialize a step input into the transformation's typed input.
pub(crate) fn decode<I: DeserializeOwned>(step: &str, item: Value) -> Result<I> {
    serde_json::from_value(item).map_err(|e| {
        PipelineError::ProgrammerError(format!("step '{}': input does not match its type: {}", step, e))
    })
}

/// Serialize a typed output back into an item.
pub(crate) fn encode<O: Serialize>(step: &str, output: O) -> Result<Value> {
    serde_json::to_value(output).map_err(|e| {
        PipelineError::ProgrammerError(format!("step '{}': output is not serializable: {}", step, e))
    })
}

/// Flatten the outcome of one expanding invocation into a sub-stream.
pub(crate) fn expansion(outcome: Result<Option<Vec<Value>>>) -> ItemStream {
    match outcome {
        Ok(Some(items)) => stream::iter(items.into_iter().map(Ok)).boxed(),
        Ok(None) => stream::empty().boxed(),
        Err(e) => stream::once(futures::future::ready(Err(e))).boxed(),
    }
}
