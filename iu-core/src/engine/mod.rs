//! HWP hint policy engine modules
//!
//! Contains the rule evaluation pass and the cpufreq hint storage.

mod hints;
mod policy;

pub use hints::{HintStore, SysfsHintStore};
pub use policy::{evaluate_power, PassSummary, PolicyEngine, SamplerTelemetry, TelemetrySource};
