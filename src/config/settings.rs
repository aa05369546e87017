//! File form of the layered configuration.
//!
//! ```json
//! {
//!   "defaults": { "retry_limit": 3, "retry_wait_ms": 2000 },
//!   "profiles": { "load-test": { "retry_limit": 0, "parallel": true } },
//!   "active_profile": "load-test",
//!   "steps": {
//!     "parse-csv":    { "order": 1 },
//!     "send-payment": { "order": 2, "retry_limit": 5, "auto_persist": true }
//!   }
//! }
//! ```
//!
//! Profiles given in the file are partial: unset fields come from the
//! file's `defaults` block. YAML is accepted behind the `yaml` feature.

use super::layered::{LayeredConfig, StepOverrides};
use super::step_config::{BackpressureStrategy, StepConfig, FALLBACK_BUFFER_CAPACITY};
use crate::error::Result;
use crate::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Optional per-field values as they appear in a settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSettings {
    /// Position in the assembled pipeline (steps only; ignored elsewhere).
    #[serde(default)]
    pub order: Option<i32>,
    #[serde(default)]
    pub retry_limit: Option<u32>,
    #[serde(default)]
    pub retry_wait_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default)]
    pub jitter: Option<bool>,
    #[serde(default)]
    pub recover_on_failure: Option<bool>,
    #[serde(default)]
    pub parallel: Option<bool>,
    #[serde(default)]
    pub backpressure_strategy: Option<String>,
    #[serde(default)]
    pub backpressure_buffer_capacity: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub batch_timeout_ms: Option<u64>,
    #[serde(default)]
    pub auto_persist: Option<bool>,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub run_blocking: Option<bool>,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

impl StepSettings {
    /// Validate and convert into runtime overrides.
    ///
    /// An unrecognized backpressure strategy falls back to `buffer` with a
    /// capacity of 128 (unless a capacity is given explicitly).
    pub fn to_overrides(&self) -> Result<StepOverrides> {
        let mut o = StepOverrides::new();
        o.retry_limit = self.retry_limit;
        o.jitter = self.jitter;
        o.recover_on_failure = self.recover_on_failure;
        o.parallel = self.parallel;
        o.auto_persist = self.auto_persist;
        o.debug = self.debug;
        o.run_blocking = self.run_blocking;
        if let Some(ms) = self.retry_wait_ms {
            o = o.retry_wait(Duration::from_millis(ms))?;
        }
        if let Some(ms) = self.max_backoff_ms {
            o = o.max_backoff(Duration::from_millis(ms))?;
        }
        if let Some(ms) = self.batch_timeout_ms {
            o = o.batch_timeout(Duration::from_millis(ms))?;
        }
        if let Some(size) = self.batch_size {
            o = o.batch_size(size)?;
        }
        if let Some(n) = self.concurrency {
            o = o.concurrency(n)?;
        }
        if let Some(capacity) = self.backpressure_buffer_capacity {
            o = o.backpressure_buffer_capacity(capacity)?;
        }
        if let Some(ref name) = self.backpressure_strategy {
            match BackpressureStrategy::parse(name) {
                Some(strategy) => o = o.backpressure_strategy(strategy),
                None => {
                    warn!(strategy = %name, "unrecognized backpressure strategy, buffering");
                    o = o.backpressure_strategy(BackpressureStrategy::Buffer);
                    if o.backpressure_buffer_capacity.is_none() {
                        o = o.backpressure_buffer_capacity(FALLBACK_BUFFER_CAPACITY)?;
                    }
                }
            }
        }
        Ok(o)
    }

    /// A complete config: these values over [`StepConfig::default`].
    pub fn to_config(&self) -> Result<StepConfig> {
        Ok(self.to_overrides()?.apply_to(&StepConfig::default()))
    }
}

/// Top-level settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSettings {
    #[serde(default)]
    pub defaults: StepSettings,
    #[serde(default)]
    pub profiles: BTreeMap<String, StepSettings>,
    #[serde(default)]
    pub active_profile: Option<String>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepSettings>,
}

impl PipelineSettings {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    #[cfg(feature = "yaml")]
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| PipelineError::InvalidConfiguration(format!("YAML settings: {}", e)))
    }

    /// Load from a file; `.yaml`/`.yml` requires the `yaml` feature.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::InvalidConfiguration(format!("reading {}: {}", path.display(), e))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            #[cfg(feature = "yaml")]
            Some("yaml") | Some("yml") => Self::from_yaml(&content),
            #[cfg(not(feature = "yaml"))]
            Some("yaml") | Some("yml") => Err(PipelineError::InvalidConfiguration(
                "YAML settings require the `yaml` feature".to_string(),
            )),
            _ => Self::from_json(&content),
        }
    }

    /// Build a fresh [`LayeredConfig`] from these settings.
    pub fn to_layered(&self) -> Result<LayeredConfig> {
        let layered = LayeredConfig::new(self.defaults.to_config()?);
        self.apply(&layered)?;
        Ok(layered)
    }

    /// Apply profiles, the active profile, and step overrides onto `layered`.
    ///
    /// Each profile is laid over this file's `defaults`, themselves laid
    /// over the defaults already held by `layered`.
    pub fn apply(&self, layered: &LayeredConfig) -> Result<()> {
        let base = self.defaults.to_overrides()?.apply_to(&layered.defaults());
        for (name, profile) in &self.profiles {
            layered.register_profile(name.clone(), profile.to_overrides()?.apply_to(&base))?;
        }
        if let Some(ref active) = self.active_profile {
            layered.activate_profile(active)?;
        }
        for (name, step) in &self.steps {
            let overrides = step.to_overrides()?;
            if !overrides.is_empty() {
                layered.set_overrides(name.clone(), overrides)?;
            }
        }
        Ok(())
    }

    /// Step names sorted by `order`; a missing order counts as 0, ties by name.
    pub fn step_order(&self) -> Vec<String> {
        let mut named: Vec<(i32, &String)> = self
            .steps
            .iter()
            .map(|(name, s)| (s.order.unwrap_or(0), name))
            .collect();
        named.sort();
        named.into_iter().map(|(_, name)| name.clone()).collect()
    }
}
