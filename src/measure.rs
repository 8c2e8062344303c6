/*
 * This file is part of intel-undervolt.
 *
 * Copyright (C) 2025 intel-undervolt contributors
 *
 * intel-undervolt is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * intel-undervolt is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with intel-undervolt. If not, see <https://www.gnu.org/licenses/>.
 */

//! Live power and load readout

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use iu_core::constants::telemetry::MEASURE_INTERVAL;
use iu_core::{CpuLoadSampler, DomainPower, EnergySampler, LoadSample};
use iu_error::{Result, UndervoltError};

/// Clear the terminal and move the cursor home
const CLEAR_SCREEN: &str = "\x1b[H\x1b[J";

/// One refresh of the readout
#[derive(Debug, Clone, Default)]
pub struct MeasureSample {
    pub domains: Vec<DomainPower>,
    pub load: Option<LoadSample>,
}

impl fmt::Display for MeasureSample {
    /// Domains without a previous reading are left out
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.domains.iter().map(|d| d.name.len()).max().unwrap_or(0) + 1;
        for domain in &self.domains {
            if let Some(watts) = domain.watts {
                let label = format!("{}:", domain.name);
                writeln!(f, "{:<width$} {:7.3} W", label, watts, width = width)?;
            }
        }
        if let Some(load) = self.load {
            writeln!(f)?;
            writeln!(
                f,
                "{:<width$} {:7.3}",
                "Load (single):",
                load.single_core,
                width = width.max(15)
            )?;
            writeln!(
                f,
                "{:<width$} {:7.3}",
                "Load (multi):",
                load.multi_core,
                width = width.max(15)
            )?;
        }
        Ok(())
    }
}

/// Telemetry query used by the `measure` command
#[derive(Debug)]
pub struct Measurement {
    energy: EnergySampler,
    load: Option<CpuLoadSampler>,
}

impl Measurement {
    /// Fails when no powercap energy domain exists
    pub fn new() -> Result<Self> {
        let energy = EnergySampler::new()?;
        let load = CpuLoadSampler::new()
            .map_err(|e| warn!("CPU load unavailable: {}", e))
            .ok();
        Self::with_samplers(energy, load)
    }

    pub fn with_samplers(energy: EnergySampler, load: Option<CpuLoadSampler>) -> Result<Self> {
        if energy.is_empty() {
            return Err(UndervoltError::HardwareNotFound("no powercap energy domains".to_string()));
        }
        Ok(Self { energy, load })
    }

    pub fn sample(&mut self) -> MeasureSample {
        let domains = self.energy.measure();
        let load = self.load.as_mut().and_then(|sampler| {
            sampler
                .measure()
                .map_err(|e| debug!("Failed to sample CPU load: {}", e))
                .ok()
        });
        MeasureSample { domains, load }
    }
}

/// Print a refreshed readout every second until `shutdown` is set
pub fn run_measure(shutdown: &AtomicBool) -> Result<()> {
    let mut measurement = Measurement::new()?;
    let stdout = io::stdout();

    while !shutdown.load(Ordering::SeqCst) {
        let sample = measurement.sample();
        let mut out = stdout.lock();
        write!(out, "{}{}", CLEAR_SCREEN, sample)
            .and_then(|_| out.flush())
            .map_err(|e| UndervoltError::io("stdout", e))?;
        drop(out);
        std::thread::sleep(MEASURE_INTERVAL);
    }
    Ok(())
}
