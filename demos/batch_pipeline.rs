//! Example: batch windows, dead-lettering and cancellation.
//!
//! Readings trickle in; a many-to-one step averages each window of up to
//! five readings (or whatever arrived within 300ms). Invalid readings fail
//! validation and go to a collecting dead-letter sink instead of stopping
//! the run.
//!
//! Run with: `cargo run --example batch_pipeline`

use futures::StreamExt;
use pipeline_framework::events::{Event, FnEventHandler};
use pipeline_framework::step::{BatchOutput, ManyToOne, OneToOne};
use pipeline_framework::{
    CollectingDeadLetter, ExecCtx, Flow, LayeredConfig, Pipeline, PipelineError, StepConfig,
    StepOverrides,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let config = LayeredConfig::new(
        StepConfig::default()
            .with_retry_limit(1)
            .with_retry_wait(Duration::from_millis(50))?
            .with_batch_size(5)?
            .with_batch_timeout(Duration::from_millis(300))?,
    );
    config.set_overrides("validate", StepOverrides::new().recover_on_failure(true))?;

    let rejected = CollectingDeadLetter::new();
    let pipeline = Pipeline::builder()
        .config(config)
        .step(
            OneToOne::new("validate", |reading: Value| async move {
                match reading.as_f64() {
                    Some(v) if (-50.0..=60.0).contains(&v) => Ok(reading),
                    _ => Err(PipelineError::ProgrammerError(format!(
                        "reading out of range: {}",
                        reading
                    ))),
                }
            })
            .with_dead_letter(rejected.clone()),
        )
        .step(
            ManyToOne::typed("average", |readings: Vec<f64>| async move {
                let mean = readings.iter().sum::<f64>() / readings.len() as f64;
                Ok(json!({ "count": readings.len(), "mean": mean }))
            })
            .with_output(BatchOutput::All),
        )
        .build()?;

    let handler = Arc::new(FnEventHandler(|event: Event| {
        if let Event::BatchClosed { size, reason, .. } = event {
            println!("  batch of {} closed ({:?})", size, reason);
        }
    }));
    let ctx = ExecCtx::builder()
        .event_handler(handler)
        .timeout(Duration::from_secs(10))
        .build();

    let readings = [21.5, 22.0, 999.0, 21.8, 22.4, 23.1, 22.9, -80.0, 21.0, 20.7, 20.9];
    let sensor = futures::stream::iter(readings)
        .enumerate()
        .then(|(i, v)| async move {
            // A pause in the middle forces a timeout-closed window.
            if i == 6 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(json!(v))
        });

    let mut windows = pipeline.run(&ctx, Flow::stream(sensor)).into_stream();
    while let Some(window) = windows.next().await {
        println!("window: {}", window?);
    }

    for dead in rejected.entries() {
        println!("rejected {} from '{}': {}", dead.item, dead.step, dead.reason);
    }
    Ok(())
}
