use crate::{
    config::{ConfigHandle, LayeredConfig, PipelineSettings},
    error::Result,
    exec_ctx::ExecCtx,
    flow::{fuse_on_error, guard, Flow},
    health::HealthGate,
    registry::StepRegistry,
    step::Step,
    PipelineError,
};
use serde_json::Value;
use std::collections::HashSet;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// An assembled, ordered list of steps.
///
/// Each step is bound to a [`ConfigHandle`] on the pipeline's
/// [`LayeredConfig`] at build time; the handle re-resolves whenever the
/// store changes, so profile switches and override edits apply to the next
/// invocation without rebuilding.
///
/// # Example
///
/// ```
/// use pipeline_framework::{ExecCtx, Flow, Pipeline};
/// use pipeline_framework::step::{OneToMany, OneToOne};
/// use futures::stream;
/// use serde_json::{json, Value};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> pipeline_framework::Result<()> {
/// let pipeline = Pipeline::builder()
///     .step(OneToMany::new("split", |line: Value| {
///         let words: Vec<_> = line
///             .as_str()
///             .unwrap_or_default()
///             .split_whitespace()
///             .map(|w| Ok(json!(w)))
///             .collect();
///         stream::iter(words)
///     }))
///     .step(OneToOne::new("upper", |w: Value| async move {
///         Ok(json!(w.as_str().unwrap_or_default().to_uppercase()))
///     }))
///     .build()?;
///
/// let ctx = ExecCtx::default();
/// let out = pipeline.run(&ctx, Flow::value(json!("hello world"))).collect().await?;
/// assert_eq!(out, vec![json!("HELLO"), json!("WORLD")]);
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    steps: Vec<(Step, ConfigHandle)>,
    config: LayeredConfig,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field(
                "steps",
                &self.steps.iter().map(|(s, _)| s.name()).collect::<Vec<_>>(),
            )
            .field("active_profile", &self.config.active_profile())
            .finish()
    }
}

impl Pipeline {
    /// Create a new pipeline builder.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Steps in execution order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().map(|(s, _)| s)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The configuration store every step resolves against.
    pub fn config(&self) -> &LayeredConfig {
        &self.config
    }

    /// The resolution handle bound to step `name`.
    pub fn handle(&self, name: &str) -> Option<&ConfigHandle> {
        self.steps
            .iter()
            .find(|(s, _)| s.name() == name)
            .map(|(_, h)| h)
    }

    /// Re-resolve every step's config now.
    pub fn reload(&self) {
        for (_, handle) in &self.steps {
            handle.reload();
        }
    }

    /// Remote endpoints declared by the steps, deduplicated, in step order.
    pub fn endpoints(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.steps()
            .filter_map(|s| s.endpoint())
            .filter(|e| seen.insert(e.to_string()))
            .map(str::to_string)
            .collect()
    }

    /// Thread `input` through every step in order.
    ///
    /// The result is lazy: nothing runs until the returned flow is polled.
    /// A stream result ends at its first error.
    pub fn run(&self, ctx: &ExecCtx, input: Flow) -> Flow {
        info!(
            steps = self.steps.len(),
            stream = input.is_stream(),
            "assembling pipeline run"
        );
        let mut current = input;
        for (step, handle) in &self.steps {
            debug!(
                step = %step.name(),
                kind = step.kind(),
                stream = current.is_stream(),
                "applying step"
            );
            if let Flow::Stream(items) = current {
                current = Flow::Stream(guard(ctx, items));
            }
            current = match step.apply(ctx, handle, current) {
                Flow::Stream(items) => Flow::Stream(fuse_on_error(items)),
                single => single,
            };
        }
        current
    }

    /// Run over a finite list of root items and gather the output.
    pub async fn run_items(&self, ctx: &ExecCtx, items: Vec<Value>) -> Result<Vec<Value>> {
        self.run(ctx, Flow::iter(items)).collect().await
    }

    /// Check every declared endpoint through `gate`, then run `input` to
    /// completion.
    ///
    /// No step runs unless all endpoints are healthy; the gate's
    /// `TransientFailure` is returned as is.
    pub async fn execute(&self, ctx: &ExecCtx, gate: &HealthGate, input: Flow) -> Result<Vec<Value>> {
        let started = Instant::now();
        info!(steps = self.steps.len(), "pipeline execution started");

        let result = match gate.ensure_healthy(ctx, self).await {
            Ok(report) => {
                debug!(endpoints = report.endpoints.len(), "endpoints healthy");
                self.run(ctx, input).collect().await
            }
            Err(e) => Err(e),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(items) => info!(items = items.len(), elapsed_ms, "pipeline execution finished"),
            Err(e) => error!(error = %e, elapsed_ms, "pipeline execution failed"),
        }
        result
    }
}

/// Builder for [`Pipeline`].
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    steps: Vec<Step>,
    config: Option<LayeredConfig>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn step(mut self, step: impl Into<Step>) -> Self {
        self.steps.push(step.into());
        self
    }

    /// Append a step (mutable reference variant).
    pub fn add(&mut self, step: impl Into<Step>) {
        self.steps.push(step.into());
    }

    /// Resolve step configs against `config`. Default: an empty store
    /// holding [`StepConfig::default`](crate::config::StepConfig::default).
    pub fn config(mut self, config: LayeredConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Steps named in `settings.steps`, created from `registry` in `order`,
    /// over a store built from `settings`.
    pub fn from_settings(settings: &PipelineSettings, registry: &StepRegistry) -> Result<Self> {
        let config = settings.to_layered()?;
        let mut builder = Self::new().config(config);
        for name in settings.step_order() {
            builder.add(registry.create(&name)?);
        }
        Ok(builder)
    }

    /// Validate and bind every step to its config handle.
    ///
    /// Fails with [`PipelineError::Assembly`] for an empty pipeline or a
    /// repeated step name, and with `InvalidConfiguration` if any step's
    /// effective config is invalid.
    pub fn build(self) -> Result<Pipeline> {
        if self.steps.is_empty() {
            return Err(PipelineError::Assembly(
                "pipeline must have at least one step".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name().to_string()) {
                return Err(PipelineError::Assembly(format!(
                    "duplicate step name '{}'",
                    step.name()
                )));
            }
        }

        let config = self.config.unwrap_or_default();
        let steps = self
            .steps
            .into_iter()
            .map(|step| {
                let handle = config.handle(step.name());
                handle.effective().validate()?;
                Ok((step, handle))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(steps = steps.len(), "pipeline assembled");
        Ok(Pipeline { steps, config })
    }
}
