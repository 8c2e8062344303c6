//! Telemetry samplers
//!
//! Both samplers keep state between calls and are meant to live as long as
//! the process that polls them.

mod energy;
mod load;

pub use energy::{DomainPower, EnergySampler};
pub use load::{CpuLoadSampler, LoadSample};

/// Look up a domain's power, treating a missing domain or the sentinel as 0 W
pub fn domain_watts(domains: &[DomainPower], name: &str) -> f64 {
    domains
        .iter()
        .find(|d| d.matches(name))
        .and_then(|d| d.watts)
        .unwrap_or(0.0)
}
