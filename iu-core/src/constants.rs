//! Constants and configuration values for intel-undervolt
//!
//! Centralizes device paths, register addresses and bit-field layouts.
//! Register layouts are the wire format against real silicon: change them only
//! together with the platform's published register map.

use std::time::Duration;

/// System paths
pub mod paths {
    /// MSR character device for the first logical CPU
    pub const MSR_DEVICE: &str = "/dev/cpu/0/msr";

    /// Physical memory device used for MMIO windows
    pub const MEM_DEVICE: &str = "/dev/mem";

    /// Per-CPU time accounting table
    pub const PROC_STAT: &str = "/proc/stat";

    /// RAPL energy counters
    pub const POWERCAP_DIR: &str = "/sys/class/powercap";

    /// cpufreq policies exposing the HWP energy performance preference
    pub const CPUFREQ_DIR: &str = "/sys/devices/system/cpu/cpufreq";

    /// Per-policy HWP hint file name
    pub const HINT_FILE: &str = "energy_performance_preference";

    /// Helper used to load missing kernel modules
    pub const MODPROBE: &str = "/sbin/modprobe";
}

/// Kernel module providing `/dev/cpu/*/msr`
pub const MSR_MODULE: &str = "msr";

/// MMIO window geometry
pub mod mmio {
    /// Size of one mapped window
    pub const MAP_SIZE: usize = 4096;

    /// Offset mask inside a window
    pub const MAP_MASK: u64 = (MAP_SIZE as u64) - 1;

    /// Width of a single guarded access
    pub const ACCESS_SIZE: usize = 8;
}

/// Voltage plane mailbox (MSR 0x150)
pub mod voltage {
    /// Center value of the 11-bit offset field
    pub const OFFSET_BASE: u64 = 0x800;

    /// Mask of the 11-bit offset magnitude after subtraction
    pub const OFFSET_MASK: u64 = OFFSET_BASE - 1;

    /// Raw offset units per millivolt
    pub const UNITS_PER_MV: f64 = 1.024;

    /// Largest offset magnitude the field can express
    pub const MAX_MILLIVOLTS: f64 = OFFSET_MASK as f64 / UNITS_PER_MV;

    /// Bit position of the offset field
    pub const OFFSET_SHIFT: u32 = 21;

    /// Bit position of the plane index
    pub const PLANE_SHIFT: u32 = 40;

    /// Busy bit plus the read-offset command
    pub const READ_REQUEST: u64 = 0x8000_0010_0000_0000;

    /// Write command bit
    pub const WRITE_COMMAND: u64 = 0x1_0000_0000;

    /// The part of the mailbox word that must survive a write
    pub const VERIFY_MASK: u64 = 0xffff_ffff;
}

/// Package RAPL power limit layout (MSR 0x610 / MCHBAR mirror)
pub mod power {
    /// Width mask of a raw power field
    pub const POWER_MASK: u64 = 0x7fff;

    /// Long term (PL1) field positions
    pub const LONG_POWER_SHIFT: u32 = 0;
    pub const LONG_ENABLE_BIT: u32 = 15;
    pub const LONG_TIME_SHIFT: u32 = 16;

    /// Short term (PL2) field positions
    pub const SHORT_POWER_SHIFT: u32 = 32;
    pub const SHORT_ENABLE_BIT: u32 = 47;
    pub const SHORT_TIME_SHIFT: u32 = 48;

    /// Mask of the 7-bit time window inside the shifted byte (bits 1..=7)
    pub const TIME_FIELD_MASK: u64 = 0xfe;

    /// Lock bit, set by firmware to freeze the register until reset
    pub const LOCK_BIT: u32 = 63;

    /// Encoded time window used when the request exceeds the representable range
    pub const TIME_SATURATED: u8 = 0xfe;

    /// Rounding up of the exponent is allowed only below this value
    pub const ROUND_UP_LIMIT: i32 = 0x19;

    /// Largest exponent the 5-bit field holds
    pub const EXPONENT_LIMIT: i32 = 0x20;

    /// log2 threshold above which the window saturates
    pub const SATURATION_LOG2: f64 = 31.0;

    /// Largest window multiplier (mantissa 3)
    pub const MAX_MULTIPLIER: f64 = 1.75;
}

/// RAPL unit register layout (MSR 0x606)
pub mod units {
    pub const POWER_UNIT_MASK: u64 = 0xf;
    pub const TIME_UNIT_SHIFT: u32 = 16;
    pub const TIME_UNIT_MASK: u64 = 0xf;
}

/// Temperature target layout (MSR 0x1a2)
pub mod temperature {
    /// Bit position of the TCC activation offset
    pub const OFFSET_SHIFT: u32 = 24;

    /// Largest representable offset (6 bits)
    pub const OFFSET_MAX: u64 = 0x3f;

    /// Mask clearing the offset field
    pub const CLEAR_MASK: u64 = 0xffff_ffff_c0ff_ffff;
}

/// A power domain that can be limited through the MSR, an MMIO mirror or both
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerDomainInfo {
    pub name: &'static str,
    /// Physical address of the MMIO mirror (0 = none)
    pub mem_addr: u64,
    /// MSR address (0 = none)
    pub msr_addr: u32,
}

/// Every power domain the tool knows about, in reporting order
pub const POWER_DOMAINS: [PowerDomainInfo; 1] = [PowerDomainInfo {
    name: "package",
    mem_addr: 0xfed1_59a0,
    msr_addr: 0x610,
}];

/// Number of entries in [`POWER_DOMAINS`]
pub const DOMAIN_COUNT: usize = POWER_DOMAINS.len();

/// Look up a power domain index by name
pub fn domain_index(name: &str) -> Option<usize> {
    POWER_DOMAINS.iter().position(|d| d.name == name)
}

/// Telemetry defaults
pub mod telemetry {
    use super::Duration;

    /// Sampling period of the `measure` command
    pub const MEASURE_INTERVAL: Duration = Duration::from_secs(1);

    /// Field index of the idle counter in a `/proc/stat` cpu line
    pub const IDLE_FIELD: usize = 3;

    /// Minimum number of counters a `/proc/stat` cpu line must carry
    pub const MIN_FIELDS: usize = 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_lookup() {
        assert_eq!(domain_index("package"), Some(0));
        assert_eq!(domain_index("core"), None);
    }

    #[test]
    fn test_masks_are_consistent() {
        assert_eq!(voltage::OFFSET_MASK, 0x7ff);
        assert_eq!(mmio::MAP_MASK, 0xfff);
        let field = temperature::OFFSET_MAX << temperature::OFFSET_SHIFT;
        assert_eq!(temperature::CLEAR_MASK & field, 0);
    }
}
