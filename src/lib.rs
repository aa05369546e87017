//! # Pipeline Framework
//!
//! Multi-stage data pipelines over async streams, with a uniform execution
//! contract for every step.
//!
//! A pipeline is an ordered list of [`Step`]s threaded over a [`Flow`]: either
//! a single future item or a stream of items. Each step retries its
//! transformation with exponential backoff, rejects null input, and on final
//! failure either dead-letters the item or fails the run.
//!
//! ## Core Concepts
//!
//! - **[`Step`]** — closed enum over the five variants: [`OneToOne`],
//!   [`OneToMany`], [`ManyToOne`] (batch windows), [`ManyToMany`] and
//!   [`SideEffect`].
//! - **[`StepConfig`]** — retry, backpressure, batching and dispatch
//!   settings, resolved per step from a [`LayeredConfig`]
//!   (override > active profile > defaults).
//! - **[`Pipeline`]** — assembled, validated step list; `run` dispatches on
//!   the current flow shape.
//! - **[`ExecCtx`]** — cancellation flag, deadline, event handler and the
//!   blocking worker pool.
//! - **[`RemoteCallAdapter`]** — persist-then-invoke wrapper for steps that
//!   cross a process boundary.
//!
//! ## Quick Start
//!
//! ```
//! use pipeline_framework::{ExecCtx, Flow, LayeredConfig, Pipeline, StepConfig};
//! use pipeline_framework::step::{ManyToOne, OneToMany};
//! use futures::stream;
//! use serde_json::{json, Value};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> pipeline_framework::Result<()> {
//! let config = LayeredConfig::new(StepConfig::default().with_batch_size(4)?);
//!
//! let pipeline = Pipeline::builder()
//!     .config(config)
//!     .step(OneToMany::new("explode", |item: Value| {
//!         let name = item.as_str().unwrap_or_default().to_string();
//!         stream::iter((1..=3).map(move |i| Ok(json!(format!("{}-{}", name, i)))))
//!     }))
//!     .step(ManyToOne::new("count", |batch: Vec<Value>| async move {
//!         Ok(json!(batch.len()))
//!     }))
//!     .build()?;
//!
//! let ctx = ExecCtx::default();
//! let input = Flow::iter(vec![json!("a"), json!("b")]);
//! // Six items in windows of four: the final batch holds two.
//! assert_eq!(pipeline.run(&ctx, input).last().await?, Some(json!(2)));
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod backpressure;
pub mod batch;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod events;
pub mod exec_ctx;
pub mod flow;
pub mod health;
pub mod pipeline;
pub mod registry;
pub mod remote;
pub mod retry;
pub mod step;
pub mod worker_pool;

pub use backoff::BackoffPolicy;
pub use config::{
    BackpressureStrategy, ConfigHandle, LayeredConfig, PipelineSettings, StepConfig, StepOverrides,
};
pub use dead_letter::{CollectingDeadLetter, DeadLetterSink, LoggingDeadLetter};
pub use error::{PipelineError, Result, TransportStatus};
pub use events::{Event, EventHandler};
pub use exec_ctx::{ExecCtx, ExecCtxBuilder};
pub use flow::{BoxFut, Flow, ItemFuture, ItemStream};
pub use health::{HealthGate, HealthProbe, HealthReport, HttpHealthProbe};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use registry::StepRegistry;
pub use remote::{InMemoryPersistence, Persistence, RemoteCallAdapter};
pub use step::{BatchOutput, ManyToMany, ManyToOne, OneToMany, OneToOne, SideEffect, Step};
pub use worker_pool::BlockingPool;
