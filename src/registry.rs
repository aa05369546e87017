//! Name → step factory map, for assembling pipelines from settings files.

use crate::error::Result;
use crate::step::Step;
use crate::PipelineError;
use std::collections::BTreeMap;
use std::sync::Arc;

type Factory = Arc<dyn Fn(&str) -> Step + Send + Sync>;

/// Known step kinds, keyed by the name used in settings.
///
/// # Example
///
/// ```
/// use pipeline_framework::registry::StepRegistry;
/// use pipeline_framework::step::OneToOne;
///
/// let mut registry = StepRegistry::new();
/// registry.register("echo", |name| OneToOne::new(name, |v| async move { Ok(v) }).into());
/// assert!(registry.create("echo").is_ok());
/// assert!(registry.create("missing").is_err());
/// ```
#[derive(Default, Clone)]
pub struct StepRegistry {
    factories: BTreeMap<String, Factory>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. It receives the name the step is created under.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&str) -> Step + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Create the step registered as `name`.
    pub fn create(&self, name: &str) -> Result<Step> {
        let factory = self.factories.get(name).ok_or_else(|| {
            PipelineError::Assembly(format!("no step registered under '{}'", name))
        })?;
        let step = factory(name);
        if step.name() != name {
            return Err(PipelineError::Assembly(format!(
                "factory for '{}' built a step named '{}'",
                name,
                step.name()
            )));
        }
        Ok(step)
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
