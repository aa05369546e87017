//! Layered configuration: global defaults, named profiles, per-step overrides.
//!
//! A step's effective config resolves each field independently:
//! an explicitly set override wins, else the active profile's value, else
//! the defaults. "Set" is tracked per field with `Option`, so an override
//! equal to the type's zero value still counts.
//!
//! [`LayeredConfig`] is a cheap-to-clone shared handle. Every mutation bumps
//! a generation counter; [`ConfigHandle`] caches a step's resolved config
//! and re-resolves when the generation has moved, so profile activation or
//! override changes apply to the next step invocation without rebuilding
//! the pipeline. Mutation is not linearizable with in-flight invocations:
//! an item already past resolution keeps the config it saw.

use super::step_config::{positive_duration, positive_size, BackpressureStrategy, StepConfig};
use crate::error::Result;
use crate::PipelineError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::debug;

/// Explicitly set per-step values. `None` means "inherit".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOverrides {
    pub retry_limit: Option<u32>,
    pub retry_wait: Option<Duration>,
    pub max_backoff: Option<Duration>,
    pub jitter: Option<bool>,
    pub recover_on_failure: Option<bool>,
    pub parallel: Option<bool>,
    pub backpressure_strategy: Option<BackpressureStrategy>,
    pub backpressure_buffer_capacity: Option<usize>,
    pub batch_size: Option<usize>,
    pub batch_timeout: Option<Duration>,
    pub auto_persist: Option<bool>,
    pub debug: Option<bool>,
    pub run_blocking: Option<bool>,
    pub concurrency: Option<usize>,
}

impl StepOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    pub fn retry_wait(mut self, wait: Duration) -> Result<Self> {
        self.retry_wait = Some(positive_duration("retry_wait", wait)?);
        Ok(self)
    }

    pub fn max_backoff(mut self, max: Duration) -> Result<Self> {
        self.max_backoff = Some(positive_duration("max_backoff", max)?);
        Ok(self)
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = Some(enabled);
        self
    }

    pub fn recover_on_failure(mut self, enabled: bool) -> Self {
        self.recover_on_failure = Some(enabled);
        self
    }

    pub fn parallel(mut self, enabled: bool) -> Self {
        self.parallel = Some(enabled);
        self
    }

    pub fn backpressure_strategy(mut self, strategy: BackpressureStrategy) -> Self {
        self.backpressure_strategy = Some(strategy);
        self
    }

    pub fn backpressure_buffer_capacity(mut self, capacity: usize) -> Result<Self> {
        self.backpressure_buffer_capacity =
            Some(positive_size("backpressure_buffer_capacity", capacity)?);
        Ok(self)
    }

    pub fn batch_size(mut self, size: usize) -> Result<Self> {
        self.batch_size = Some(positive_size("batch_size", size)?);
        Ok(self)
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.batch_timeout = Some(positive_duration("batch_timeout", timeout)?);
        Ok(self)
    }

    pub fn auto_persist(mut self, enabled: bool) -> Self {
        self.auto_persist = Some(enabled);
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = Some(enabled);
        self
    }

    pub fn run_blocking(mut self, enabled: bool) -> Self {
        self.run_blocking = Some(enabled);
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Result<Self> {
        self.concurrency = Some(positive_size("concurrency", concurrency)?);
        Ok(self)
    }

    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        *self == StepOverrides::default()
    }

    /// Lay these overrides over `base`, field by field.
    pub fn apply_to(&self, base: &StepConfig) -> StepConfig {
        StepConfig {
            retry_limit: self.retry_limit.unwrap_or(base.retry_limit),
            retry_wait: self.retry_wait.unwrap_or(base.retry_wait),
            max_backoff: self.max_backoff.unwrap_or(base.max_backoff),
            jitter: self.jitter.unwrap_or(base.jitter),
            recover_on_failure: self.recover_on_failure.unwrap_or(base.recover_on_failure),
            parallel: self.parallel.unwrap_or(base.parallel),
            backpressure_strategy: self
                .backpressure_strategy
                .unwrap_or(base.backpressure_strategy),
            backpressure_buffer_capacity: self
                .backpressure_buffer_capacity
                .unwrap_or(base.backpressure_buffer_capacity),
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            batch_timeout: self.batch_timeout.unwrap_or(base.batch_timeout),
            auto_persist: self.auto_persist.unwrap_or(base.auto_persist),
            debug: self.debug.unwrap_or(base.debug),
            run_blocking: self.run_blocking.unwrap_or(base.run_blocking),
            concurrency: self.concurrency.unwrap_or(base.concurrency),
        }
    }
}

#[derive(Debug, Default)]
struct Layers {
    defaults: StepConfig,
    profiles: HashMap<String, StepConfig>,
    active_profile: Option<String>,
    overrides: HashMap<String, StepOverrides>,
}

impl Layers {
    /// Overrides must yield a valid config over the defaults and every profile.
    fn check(&self, overrides: &StepOverrides) -> Result<()> {
        overrides.apply_to(&self.defaults).validate()?;
        for config in self.profiles.values() {
            overrides.apply_to(config).validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Shared {
    layers: RwLock<Layers>,
    generation: AtomicU64,
}

/// Shared defaults → profiles → overrides store.
///
/// # Example
///
/// ```
/// use pipeline_framework::config::{LayeredConfig, StepConfig, StepOverrides};
///
/// let layered = LayeredConfig::new(StepConfig::default().with_retry_limit(3));
/// layered.register_profile("p", StepConfig::default().with_retry_limit(5)).unwrap();
/// layered.activate_profile("p").unwrap();
/// layered.set_overrides("send", StepOverrides::new().retry_limit(1)).unwrap();
///
/// assert_eq!(layered.resolve("send").retry_limit, 1);
/// layered.clear_overrides("send");
/// assert_eq!(layered.resolve("send").retry_limit, 5);
/// layered.deactivate_profile();
/// assert_eq!(layered.resolve("send").retry_limit, 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct LayeredConfig {
    shared: Arc<Shared>,
}

impl LayeredConfig {
    pub fn new(defaults: StepConfig) -> Self {
        let config = Self::default();
        config.write().defaults = defaults;
        config
    }

    fn read(&self) -> RwLockReadGuard<'_, Layers> {
        self.shared
            .layers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Layers> {
        self.shared
            .layers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Monotonic counter, advanced by every mutation.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    pub fn defaults(&self) -> StepConfig {
        self.read().defaults.clone()
    }

    pub fn set_defaults(&self, defaults: StepConfig) -> Result<()> {
        defaults.validate()?;
        self.write().defaults = defaults;
        self.bump();
        Ok(())
    }

    /// Register (or replace) a named profile.
    pub fn register_profile(&self, name: impl Into<String>, config: StepConfig) -> Result<()> {
        config.validate()?;
        let name = name.into();
        debug!(profile = %name, "registering config profile");
        self.write().profiles.insert(name, config);
        self.bump();
        Ok(())
    }

    /// Make `name` the active profile. Unknown names are rejected.
    pub fn activate_profile(&self, name: &str) -> Result<()> {
        {
            let mut layers = self.write();
            if !layers.profiles.contains_key(name) {
                return Err(PipelineError::InvalidConfiguration(format!(
                    "unknown profile '{}'",
                    name
                )));
            }
            layers.active_profile = Some(name.to_string());
        }
        debug!(profile = %name, "activated config profile");
        self.bump();
        Ok(())
    }

    pub fn deactivate_profile(&self) {
        self.write().active_profile = None;
        self.bump();
    }

    pub fn active_profile(&self) -> Option<String> {
        self.read().active_profile.clone()
    }

    pub fn profile(&self, name: &str) -> Option<StepConfig> {
        self.read().profiles.get(name).cloned()
    }

    /// Replace the overrides for `step`.
    ///
    /// Overrides built by hand through the public fields are validated
    /// here; an invalid value is rejected and nothing is stored.
    pub fn set_overrides(&self, step: impl Into<String>, overrides: StepOverrides) -> Result<()> {
        {
            let mut layers = self.write();
            layers.check(&overrides)?;
            layers.overrides.insert(step.into(), overrides);
        }
        self.bump();
        Ok(())
    }

    /// Mutate the overrides for `step` in place.
    ///
    /// The closure's error, or an invalid result, aborts the update and
    /// leaves the previous overrides untouched.
    pub fn update_overrides<F>(&self, step: &str, f: F) -> Result<()>
    where
        F: FnOnce(StepOverrides) -> Result<StepOverrides>,
    {
        {
            let mut layers = self.write();
            let current = layers.overrides.get(step).cloned().unwrap_or_default();
            let updated = f(current)?;
            layers.check(&updated)?;
            layers.overrides.insert(step.to_string(), updated);
        }
        self.bump();
        Ok(())
    }

    pub fn clear_overrides(&self, step: &str) {
        self.write().overrides.remove(step);
        self.bump();
    }

    pub fn overrides(&self, step: &str) -> StepOverrides {
        self.read().overrides.get(step).cloned().unwrap_or_default()
    }

    /// Effective config for `step`: override > active profile > defaults.
    pub fn resolve(&self, step: &str) -> StepConfig {
        let layers = self.read();
        let base = layers
            .active_profile
            .as_ref()
            .and_then(|name| layers.profiles.get(name))
            .unwrap_or(&layers.defaults);
        match layers.overrides.get(step) {
            Some(overrides) => overrides.apply_to(base),
            None => base.clone(),
        }
    }

    /// A resolution handle for `step`, bound to this store.
    pub fn handle(&self, step: impl Into<String>) -> ConfigHandle {
        ConfigHandle::new(self.clone(), step.into())
    }
}

#[derive(Debug)]
struct Cached {
    generation: u64,
    config: Arc<StepConfig>,
}

/// Per-step resolution handle with a generation-checked cache.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    step: String,
    layered: LayeredConfig,
    cache: Arc<RwLock<Option<Cached>>>,
}

impl ConfigHandle {
    fn new(layered: LayeredConfig, step: String) -> Self {
        Self {
            step,
            layered,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    /// A handle bound to a private store holding only `config`.
    pub fn fixed(step: impl Into<String>, config: StepConfig) -> Self {
        LayeredConfig::new(config).handle(step)
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn layered(&self) -> &LayeredConfig {
        &self.layered
    }

    /// The effective config, re-resolved if the store changed since the last read.
    pub fn effective(&self) -> Arc<StepConfig> {
        let generation = self.layered.generation();
        {
            let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
            if let Some(cached) = cache.as_ref() {
                if cached.generation == generation {
                    return cached.config.clone();
                }
            }
        }
        self.resolve_at(generation)
    }

    /// Force re-resolution regardless of the generation.
    pub fn reload(&self) -> Arc<StepConfig> {
        self.resolve_at(self.layered.generation())
    }

    fn resolve_at(&self, generation: u64) -> Arc<StepConfig> {
        let config = Arc::new(self.layered.resolve(&self.step));
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        *cache = Some(Cached {
            generation,
            config: config.clone(),
        });
        config
    }

    /// Mutate this step's overrides. Takes effect on the next [`effective`](Self::effective).
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(StepOverrides) -> Result<StepOverrides>,
    {
        self.layered.update_overrides(&self.step, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layered() -> LayeredConfig {
        let layered = LayeredConfig::new(StepConfig::default().with_retry_limit(3));
        layered
            .register_profile("p", StepConfig::default().with_retry_limit(5))
            .unwrap();
        layered
    }

    #[test]
    fn test_precedence_override_profile_defaults() {
        let layered = layered();
        layered.activate_profile("p").unwrap();
        layered.set_overrides("step", StepOverrides::new().retry_limit(1)).unwrap();
        assert_eq!(layered.resolve("step").retry_limit, 1);

        layered.clear_overrides("step");
        assert_eq!(layered.resolve("step").retry_limit, 5);

        layered.deactivate_profile();
        assert_eq!(layered.resolve("step").retry_limit, 3);
    }

    #[test]
    fn test_zero_valued_override_is_honoured() {
        let layered = layered();
        layered.activate_profile("p").unwrap();
        layered
            .set_overrides("step", StepOverrides::new().retry_limit(0).jitter(false))
            .unwrap();
        let config = layered.resolve("step");
        assert_eq!(config.retry_limit, 0);
        assert!(!config.jitter);
    }

    #[test]
    fn test_overrides_are_per_field() {
        let layered = layered();
        layered.set_overrides("step", StepOverrides::new().parallel(true)).unwrap();
        let config = layered.resolve("step");
        assert!(config.parallel);
        assert_eq!(config.retry_limit, 3);
        assert_eq!(layered.resolve("other").parallel, false);
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let layered = layered();
        let err = layered.activate_profile("nope").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfiguration(_)));
        assert!(layered.active_profile().is_none());
    }

    #[test]
    fn test_invalid_override_rejected_at_set_time() {
        assert!(StepOverrides::new().batch_size(0).is_err());
        assert!(StepOverrides::new().retry_wait(Duration::ZERO).is_err());
    }

    #[test]
    fn test_failed_update_leaves_overrides_untouched() {
        let layered = layered();
        layered.set_overrides("step", StepOverrides::new().retry_limit(7)).unwrap();
        let result = layered.update_overrides("step", |o| o.batch_size(0));
        assert!(result.is_err());
        assert_eq!(layered.overrides("step").retry_limit, Some(7));
    }

    #[test]
    fn test_hand_built_zero_override_rejected() {
        let layered = layered();
        let zero = StepOverrides {
            concurrency: Some(0),
            ..Default::default()
        };
        let err = layered.set_overrides("step", zero).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfiguration(_)));
        assert!(layered.overrides("step").is_empty());
        assert_eq!(layered.resolve("step").concurrency, 1);
    }

    #[test]
    fn test_update_yielding_invalid_overrides_rejected() {
        let layered = layered();
        let generation = layered.generation();
        let result = layered.update_overrides("step", |mut o| {
            o.backpressure_buffer_capacity = Some(0);
            Ok(o)
        });
        assert!(matches!(result, Err(PipelineError::InvalidConfiguration(_))));
        assert!(layered.overrides("step").is_empty());
        assert_eq!(layered.generation(), generation);
    }

    #[test]
    fn test_handle_sees_live_changes() {
        let layered = layered();
        let handle = layered.handle("step");
        assert_eq!(handle.effective().retry_limit, 3);

        layered.activate_profile("p").unwrap();
        assert_eq!(handle.effective().retry_limit, 5);

        handle.update(|o| Ok(o.retry_limit(9))).unwrap();
        assert_eq!(handle.effective().retry_limit, 9);
    }

    #[test]
    fn test_handle_caches_between_mutations() {
        let layered = layered();
        let handle = layered.handle("step");
        let first = handle.effective();
        let second = handle.effective();
        assert!(Arc::ptr_eq(&first, &second));

        let reloaded = handle.reload();
        assert!(!Arc::ptr_eq(&first, &reloaded));
        assert_eq!(*first, *reloaded);
    }

    #[test]
    fn test_fixed_handle() {
        let handle = ConfigHandle::fixed("s", StepConfig::default().with_retry_limit(0));
        assert_eq!(handle.step(), "s");
        assert_eq!(handle.effective().retry_limit, 0);
    }
}
