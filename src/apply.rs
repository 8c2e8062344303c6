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

//! Apply orchestrator
//!
//! A [`Session`] owns the long-lived device handles and runs the codecs over a
//! configuration snapshot in a fixed order: undervolt, power limits per domain,
//! thermal offset. A failing entity is logged and reported; the rest still run.

use std::fmt;
use std::path::Path;

use tracing::{debug, error, info};

use iu_core::constants::{DOMAIN_COUNT, POWER_DOMAINS};
use iu_core::{
    apply_power_limit, apply_thermal_offset, apply_undervolts, ActionKind, Config, MmioAccess,
    MmioWindow, MsrDevice, PowerLimitReport, RegisterFile, UndervoltOutcome,
};
use iu_error::{Result, UndervoltError};

use crate::config::load_config;

/// Source of register handles
#[cfg_attr(test, mockall::automock)]
pub trait DeviceProvider {
    fn open_registers(&mut self) -> Result<Box<dyn RegisterFile>>;
    fn map_window(&mut self, phys_addr: u64) -> Result<Box<dyn MmioAccess>>;
}

/// `/dev/cpu/0/msr` and `/dev/mem`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDevices;

impl DeviceProvider for SystemDevices {
    fn open_registers(&mut self) -> Result<Box<dyn RegisterFile>> {
        Ok(Box::new(MsrDevice::open()?))
    }

    fn map_window(&mut self, phys_addr: u64) -> Result<Box<dyn MmioAccess>> {
        Ok(Box::new(MmioWindow::map(phys_addr)?))
    }
}

/// Result of one entity
#[derive(Debug)]
pub enum Report {
    Undervolt(UndervoltOutcome),
    Power {
        domain: &'static str,
        write: bool,
        result: Result<PowerLimitReport>,
    },
    Thermal {
        write: bool,
        result: Result<i32>,
    },
}

impl Report {
    pub fn is_ok(&self) -> bool {
        match self {
            Self::Undervolt(outcome) => outcome.is_ok(),
            Self::Power { result, .. } => result.is_ok(),
            Self::Thermal { result, .. } => result.is_ok(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Undervolt(_) => ActionKind::Undervolt,
            Self::Power { .. } => ActionKind::Power,
            Self::Thermal { .. } => ActionKind::Thermal,
        }
    }

    /// Undervolt failures are logged by the codec itself
    fn log_failure(&self) {
        match self {
            Self::Power { domain, result: Err(e), .. } => {
                error!(domain = *domain, "Failed to apply {} power limit: {}", domain, e)
            }
            Self::Thermal { result: Err(e), .. } => {
                error!("Failed to apply temperature offset: {}", e)
            }
            _ => {}
        }
    }
}

fn verb(write: bool) -> &'static str {
    if write {
        "write"
    } else {
        "read"
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undervolt(outcome) => write!(f, "{}", outcome),
            Self::Power { result: Ok(report), .. } => write!(f, "{}", report),
            Self::Power { domain, write, result: Err(e) } => {
                write!(f, "Failed to {} {} power values: {}", verb(*write), domain, e)
            }
            Self::Thermal { result: Ok(offset), .. } => write!(f, "Critical offset: {}°C", offset),
            Self::Thermal { write, result: Err(e) } => {
                write!(f, "Failed to {} temperature offset: {}", verb(*write), e)
            }
        }
    }
}

/// Aggregate of one read/apply pass
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub success: bool,
    pub reports: Vec<Report>,
}

impl fmt::Display for ApplyOutcome {
    /// Groups are separated by a blank line
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut previous: Option<ActionKind> = None;
        for report in &self.reports {
            let kind = report.kind();
            match previous {
                Some(prev) if prev != kind || kind == ActionKind::Power => writeln!(f)?,
                _ => {}
            }
            writeln!(f, "{}", report)?;
            previous = Some(kind);
        }
        Ok(())
    }
}

/// Long-lived device handles for one configuration
pub struct Session<P: DeviceProvider = SystemDevices> {
    provider: P,
    regs: Option<Box<dyn RegisterFile>>,
    windows: [Option<Box<dyn MmioAccess>>; DOMAIN_COUNT],
}

impl<P: DeviceProvider> Session<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            regs: None,
            windows: Default::default(),
        }
    }

    pub fn has_registers(&self) -> bool {
        self.regs.is_some()
    }

    pub fn mapped_windows(&self) -> usize {
        self.windows.iter().filter(|w| w.is_some()).count()
    }

    /// Open what `config` needs and release what it no longer does
    pub fn prepare(&mut self, config: &Config) -> Result<()> {
        if config.needs_msr() {
            if self.regs.is_none() {
                self.regs = Some(self.provider.open_registers()?);
                debug!("Opened MSR device");
            }
        } else if self.regs.take().is_some() {
            debug!("Closed MSR device");
        }

        for (index, domain) in POWER_DOMAINS.iter().enumerate() {
            let wanted = config.power[index].is_some() && domain.mem_addr != 0;
            if wanted {
                if self.windows[index].is_none() {
                    self.windows[index] = Some(self.provider.map_window(domain.mem_addr)?);
                }
            } else if self.windows[index].take().is_some() {
                debug!(domain = domain.name, "Released MMIO window");
            }
        }
        Ok(())
    }

    fn registers(&mut self) -> Result<&mut (dyn RegisterFile + 'static)> {
        self.regs
            .as_deref_mut()
            .ok_or_else(|| UndervoltError::HardwareNotFound("MSR device is not open".to_string()))
    }

    pub fn undervolt(&mut self, config: &Config, write: bool) -> Vec<Report> {
        if config.undervolts.is_empty() {
            return Vec::new();
        }
        match self.registers() {
            Ok(regs) => apply_undervolts(regs, &config.undervolts, write)
                .into_iter()
                .map(Report::Undervolt)
                .collect(),
            Err(e) => {
                let message = e.to_string();
                config
                    .undervolts
                    .iter()
                    .map(|t| {
                        Report::Undervolt(UndervoltOutcome {
                            plane: t.plane,
                            title: t.title.clone(),
                            result: Err(UndervoltError::HardwareNotFound(message.clone())),
                        })
                    })
                    .collect()
            }
        }
    }

    pub fn power(&mut self, config: &Config, write: bool) -> Vec<Report> {
        let mut reports = Vec::new();
        for (index, domain) in POWER_DOMAINS.iter().enumerate() {
            let Some(spec) = config.power[index].as_ref() else {
                continue;
            };
            let window = self.windows[index].as_deref_mut();
            let result = match self.regs.as_deref_mut() {
                Some(regs) => apply_power_limit(domain, spec, regs, window, write),
                None => Err(UndervoltError::HardwareNotFound("MSR device is not open".to_string())),
            };
            reports.push(Report::Power {
                domain: domain.name,
                write,
                result,
            });
        }
        reports
    }

    pub fn thermal(&mut self, config: &Config, write: bool) -> Vec<Report> {
        let Some(offset) = config.tjoffset else {
            return Vec::new();
        };
        let result = self
            .registers()
            .and_then(|regs| apply_thermal_offset(regs, offset, write));
        vec![Report::Thermal { write, result }]
    }

    /// Run one action kind
    pub fn run_action(&mut self, config: &Config, kind: ActionKind, write: bool) -> Vec<Report> {
        let reports = match kind {
            ActionKind::Undervolt => self.undervolt(config, write),
            ActionKind::Power => self.power(config, write),
            ActionKind::Thermal => self.thermal(config, write),
        };
        for report in &reports {
            report.log_failure();
        }
        reports
    }

    /// Undervolt, then power limits, then the thermal offset
    pub fn read_apply(&mut self, config: &Config, write: bool) -> ApplyOutcome {
        let reports: Vec<Report> = [ActionKind::Undervolt, ActionKind::Power, ActionKind::Thermal]
            .into_iter()
            .flat_map(|kind| self.run_action(config, kind, write))
            .collect();
        let success = reports.iter().all(Report::is_ok);
        info!(
            entities = reports.len(),
            "{} finished {}",
            if write { "Apply" } else { "Read" },
            if success { "successfully" } else { "with errors" }
        );
        ApplyOutcome { success, reports }
    }
}

fn run_once(config_path: &Path, write: bool) -> Result<ApplyOutcome> {
    let config = load_config(config_path)?;
    let mut session = Session::new(SystemDevices);
    session.prepare(&config)?;
    Ok(session.read_apply(&config, write))
}

/// Report the current register values
pub fn read_values(config_path: &Path) -> Result<ApplyOutcome> {
    run_once(config_path, false)
}

/// Write the configured values and report what the hardware kept
pub fn apply_values(config_path: &Path) -> Result<ApplyOutcome> {
    run_once(config_path, true)
}
