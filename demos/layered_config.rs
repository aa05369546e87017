//! Example: defaults, profiles and per-step overrides.
//!
//! Loads settings from JSON (or a file given as the first argument), then
//! switches profiles and edits overrides on a built pipeline without
//! rebuilding it.
//!
//! Run with: `cargo run --example layered_config [settings.json]`

use pipeline_framework::registry::StepRegistry;
use pipeline_framework::step::{OneToOne, SideEffect};
use pipeline_framework::{PipelineBuilder, PipelineSettings, StepOverrides};
use tracing_subscriber::EnvFilter;

const SETTINGS: &str = r#"{
    "defaults": { "retry_limit": 3, "retry_wait_ms": 2000 },
    "profiles": {
        "fast": { "retry_limit": 5, "retry_wait_ms": 100, "jitter": true },
        "bulk": { "batch_size": 500, "backpressure_strategy": "drop" }
    },
    "active_profile": "fast",
    "steps": {
        "enrich": { "order": 1, "retry_limit": 1 },
        "audit": { "order": 2, "concurrency": 4 }
    }
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = match std::env::args().nth(1) {
        Some(path) => PipelineSettings::from_file(path)?,
        None => PipelineSettings::from_json(SETTINGS)?,
    };

    let mut registry = StepRegistry::new();
    registry
        .register("enrich", |name| OneToOne::new(name, |v| async move { Ok(v) }).into())
        .register("audit", |name| SideEffect::new(name, |_| async { Ok(()) }).into());

    let pipeline = PipelineBuilder::from_settings(&settings, &registry)?.build()?;
    let layered = pipeline.config().clone();

    let show = |label: &str| {
        println!("{}", label);
        for step in pipeline.steps() {
            if let Some(handle) = pipeline.handle(step.name()) {
                let c = handle.effective();
                println!(
                    "  {:<8} retry_limit={} retry_wait={:?} jitter={} concurrency={} strategy={:?}",
                    step.name(),
                    c.retry_limit,
                    c.retry_wait,
                    c.jitter,
                    c.concurrency,
                    c.backpressure_strategy
                );
            }
        }
    };

    show("profile 'fast' active:");

    layered.clear_overrides("enrich");
    show("override on 'enrich' removed:");

    layered.activate_profile("bulk")?;
    show("profile 'bulk' active:");

    layered.deactivate_profile();
    layered.set_overrides("audit", StepOverrides::new().retry_limit(0).parallel(true))?;
    show("no profile, 'audit' overridden:");

    Ok(())
}
