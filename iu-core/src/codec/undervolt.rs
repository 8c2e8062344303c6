//! Voltage plane offset codec
//!
//! Offsets go through the MSR 0x150 mailbox: a write command carries the
//! new offset, a read command makes the mailbox report the plane's current
//! offset on the next read.

use std::fmt;

use tracing::{debug, error};

use crate::constants::voltage;
use crate::data::UndervoltTarget;
use crate::error::{Result, UndervoltError};
use crate::hw::{Msr, RegisterFile};

/// 11-bit offset field for `millivolts`, already shifted into place
///
/// Magnitudes beyond [`voltage::MAX_MILLIVOLTS`] saturate instead of
/// wrapping into a small offset.
pub fn encode_offset(millivolts: f64) -> u64 {
    let units = (millivolts.abs() * voltage::UNITS_PER_MV).min(voltage::OFFSET_MASK as f64);
    let field = (voltage::OFFSET_BASE as f64 - units).round() as u64;
    (field << voltage::OFFSET_SHIFT) & voltage::VERIFY_MASK
}

/// Millivolts (negative) reported by a mailbox read
pub fn decode_offset(value: u64) -> f64 {
    let units =
        voltage::OFFSET_BASE.wrapping_sub(value >> voltage::OFFSET_SHIFT) & voltage::OFFSET_MASK;
    -(units as f64 / voltage::UNITS_PER_MV)
}

pub fn read_request(plane: u8) -> u64 {
    voltage::READ_REQUEST | (u64::from(plane) << voltage::PLANE_SHIFT)
}

pub fn write_request(plane: u8, millivolts: f64) -> u64 {
    read_request(plane) | voltage::WRITE_COMMAND | encode_offset(millivolts)
}

/// Run the mailbox protocol for one plane, returning the read-back in mV
pub fn apply_undervolt(
    regs: &mut dyn RegisterFile,
    target: &UndervoltTarget,
    write: bool,
) -> Result<f64> {
    let entity = || format!("{} ({})", target.title, target.plane);
    let command = write_request(target.plane, target.millivolts);

    if write {
        regs.write(Msr::VOLTAGE, command)
            .map_err(|e| relabel(e, entity()))?;
    }
    regs.write(Msr::VOLTAGE, read_request(target.plane))
        .map_err(|e| relabel(e, entity()))?;
    let value = regs.read(Msr::VOLTAGE).map_err(|e| relabel(e, entity()))?;
    debug!(plane = target.plane, "voltage mailbox {:#018x}", value);

    if write && (value & voltage::VERIFY_MASK) != (command & voltage::VERIFY_MASK) {
        return Err(UndervoltError::VerificationMismatch {
            entity: entity(),
            written: command & voltage::VERIFY_MASK,
            read: value & voltage::VERIFY_MASK,
        });
    }

    Ok(decode_offset(value))
}

fn relabel(err: UndervoltError, entity: String) -> UndervoltError {
    match err {
        UndervoltError::Io { source, .. } => UndervoltError::Io { target: entity, source },
        other => other,
    }
}

/// Result of one plane
#[derive(Debug)]
pub struct UndervoltOutcome {
    pub plane: u8,
    pub title: String,
    pub result: Result<f64>,
}

impl UndervoltOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

impl fmt::Display for UndervoltOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            Ok(mv) => write!(f, "{} ({}): {:.2} mV", self.title, self.plane, mv),
            Err(e) => write!(f, "{} ({}): {}", self.title, self.plane, e),
        }
    }
}

/// Apply every target in order; one plane failing never stops the rest
pub fn apply_undervolts(
    regs: &mut dyn RegisterFile,
    targets: &[UndervoltTarget],
    write: bool,
) -> Vec<UndervoltOutcome> {
    targets
        .iter()
        .map(|target| {
            let result = apply_undervolt(regs, target, write);
            if let Err(e) = &result {
                error!(plane = target.plane, "{}", e);
            }
            UndervoltOutcome {
                plane: target.plane,
                title: target.title.clone(),
                result,
            }
        })
        .collect()
}
