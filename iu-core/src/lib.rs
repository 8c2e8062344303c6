//! intel-undervolt core library
//!
//! Register-level tuning of Intel CPUs on Linux.
//!
//! # Features
//!
//! - **Voltage offsets**: Per-plane undervolting through the MSR 0x150 mailbox
//! - **Power limits**: RAPL short/long term limits, written to the MSR and its MMIO mirror
//! - **Thermal offset**: TCC activation offset below TjMax
//! - **HWP hints**: Telemetry-driven energy performance preference switching
//!
//! # Module Structure
//!
//! - `hw/` - Privileged register access (msr device, `/dev/mem` windows)
//! - `codec/` - Bit layouts of the tuned registers
//! - `telemetry/` - CPU load and energy samplers
//! - `engine/` - HWP hint policy engine
//! - `data/` - Configuration snapshot types
//!
//! # Example
//!
//! ```no_run
//! use iu_core::{apply_thermal_offset, MsrDevice};
//!
//! let mut msr = MsrDevice::open().unwrap();
//! let offset = apply_thermal_offset(&mut msr, -20, true).unwrap();
//! println!("Critical offset: {}°C", offset);
//! ```

// Grouped modules
pub mod codec;
pub mod data;
pub mod engine;
pub mod hw;
pub mod telemetry;

// Standalone modules
pub mod constants;
pub mod error;

pub use codec::{
    apply_power_limit, apply_thermal_offset, apply_undervolt, apply_undervolts,
    PowerLimitReport, RaplUnits, UndervoltOutcome,
};

pub use data::{
    ActionKind, Combinator, Comparison, Config, DaemonAction, HintMode, HintRule, LoadCapture,
    PowerCondition, PowerLimitSpec, PowerTerm, Predicate, UndervoltTarget,
};

pub use engine::{
    HintStore, PassSummary, PolicyEngine, SamplerTelemetry, SysfsHintStore, TelemetrySource,
};

pub use error::{Result, UndervoltError};

pub use hw::{load_kernel_module, MmioAccess, MmioWindow, Msr, MsrDevice, RegisterFile};

pub use telemetry::{CpuLoadSampler, DomainPower, EnergySampler, LoadSample};

pub use constants::{PowerDomainInfo, POWER_DOMAINS};
