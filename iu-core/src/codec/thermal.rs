//! TCC activation offset codec

use tracing::debug;

use crate::constants::temperature;
use crate::error::Result;
use crate::hw::{Msr, RegisterFile};

/// Replace the 6-bit offset field, clamping the magnitude to 63 °C
pub fn encode_thermal_offset(current: u64, offset: i32) -> u64 {
    let magnitude = u64::from(offset.unsigned_abs()).min(temperature::OFFSET_MAX);
    (current & temperature::CLEAR_MASK) | (magnitude << temperature::OFFSET_SHIFT)
}

/// Offset below TjMax in °C (zero or negative)
pub fn decode_thermal_offset(value: u64) -> i32 {
    -(((value >> temperature::OFFSET_SHIFT) & temperature::OFFSET_MAX) as i32)
}

/// Read, and optionally rewrite, the offset; returns the value read back
pub fn apply_thermal_offset(regs: &mut dyn RegisterFile, offset: i32, write: bool) -> Result<i32> {
    if write {
        let current = regs.read(Msr::TEMPERATURE_TARGET)?;
        let value = encode_thermal_offset(current, offset);
        debug!("temperature target {:#018x} -> {:#018x}", current, value);
        regs.write(Msr::TEMPERATURE_TARGET, value)?;
    }
    Ok(decode_thermal_offset(regs.read(Msr::TEMPERATURE_TARGET)?))
}
