//! Step configuration: per-step parameters, the layered store, and the
//! settings-file form.

pub mod layered;
pub mod settings;
pub mod step_config;

pub use layered::{ConfigHandle, LayeredConfig, StepOverrides};
pub use settings::{PipelineSettings, StepSettings};
pub use step_config::{BackpressureStrategy, StepConfig, FALLBACK_BUFFER_CAPACITY};
