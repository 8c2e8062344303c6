//! RAPL power limit codec
//!
//! # Register layout
//!
//! ```text
//!  63   55    49 48 47 46        32 31   23    17 16 15 14         0
//! +---+---------+--+--+------------+----+---------+--+--+------------+
//! |L  | time    |C |E | power      |    | time    |C |E | power      |
//! +---+---------+--+--+------------+----+---------+--+--+------------+
//!       short term                        long term
//! ```
//!
//! `L` locks the register until reset, `C` is the clamp bit (preserved),
//! `E` the enable bit. A time window field holds a 5-bit exponent in its bits
//! 1-5 and a 2-bit mantissa selecting multiplier 1, 1.25, 1.5 or 1.75 in bits 6-7.
//!
//! The same word lives in an MSR and in an MMIO mirror; both are written.

use std::fmt;

use tracing::{debug, warn};

use crate::constants::{mmio, power, units, PowerDomainInfo};
use crate::data::{PowerLimitSpec, PowerTerm};
use crate::error::{Result, UndervoltError};
use crate::hw::{MmioAccess, Msr, RegisterFile};

/// RAPL units from MSR 0x606
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaplUnits {
    /// Raw power counts per watt
    pub power_unit: f64,
    /// Raw time counts per second
    pub time_unit: f64,
}

impl RaplUnits {
    pub fn from_register(value: u64) -> Self {
        let power_exp = value & units::POWER_UNIT_MASK;
        let time_exp = (value >> units::TIME_UNIT_SHIFT) & units::TIME_UNIT_MASK;
        Self {
            power_unit: (1u64 << power_exp) as f64,
            time_unit: (1u64 << time_exp) as f64,
        }
    }

    /// Largest wattage the 15-bit field can express
    pub fn max_watts(&self) -> f64 {
        power::POWER_MASK as f64 / self.power_unit
    }
}

/// Seconds encoded by a time window byte (clamp bit in bit 0 is ignored)
pub fn decode_time_window(field: u8, time_unit: f64) -> f64 {
    let multiplier = 1.0 + f64::from((field >> 6) & 0x3) / 4.0;
    let exponent = i32::from((field >> 1) & 0x1f);
    2f64.powi(exponent) * multiplier / time_unit
}

/// Closest time window byte for `seconds`
pub fn encode_time_window(seconds: f64, time_unit: f64) -> u8 {
    let scaled = seconds * time_unit;
    if (scaled / power::MAX_MULTIPLIER).log2() >= power::SATURATION_LOG2 {
        return power::TIME_SATURATED;
    }

    let mut best_diff = 1.0;
    let mut best = 0u8;
    for mantissa in 0u8..4 {
        let multiplier = 1.0 + f64::from(mantissa) / 4.0;
        let exact = (scaled / multiplier).log2();
        let mut exponent = exact.floor() as i32;
        let mut diff = exact - f64::from(exponent);
        if exponent < power::ROUND_UP_LIMIT && diff > 0.5 {
            exponent += 1;
            diff = 1.0 - diff;
        }
        if !(0..power::EXPONENT_LIMIT).contains(&exponent) {
            continue;
        }
        if diff < best_diff {
            best_diff = diff;
            best = (mantissa << 6) | ((exponent as u8) << 1);
        }
    }
    best
}

/// Decoded view of one term
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerTermReading {
    pub watts: f64,
    pub seconds: f64,
    pub enabled: bool,
}

/// Decoded view of a whole power limit register
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerLimitReading {
    pub short_term: PowerTermReading,
    pub long_term: PowerTermReading,
    pub locked: bool,
}

fn decode_term(
    value: u64,
    power_shift: u32,
    enable_bit: u32,
    time_shift: u32,
    units: &RaplUnits,
) -> PowerTermReading {
    PowerTermReading {
        watts: ((value >> power_shift) & power::POWER_MASK) as f64 / units.power_unit,
        seconds: decode_time_window((value >> time_shift) as u8, units.time_unit),
        enabled: (value >> enable_bit) & 1 == 1,
    }
}

pub fn decode_power_limit(value: u64, units: &RaplUnits) -> PowerLimitReading {
    PowerLimitReading {
        short_term: decode_term(
            value,
            power::SHORT_POWER_SHIFT,
            power::SHORT_ENABLE_BIT,
            power::SHORT_TIME_SHIFT,
            units,
        ),
        long_term: decode_term(
            value,
            power::LONG_POWER_SHIFT,
            power::LONG_ENABLE_BIT,
            power::LONG_TIME_SHIFT,
            units,
        ),
        locked: (value >> power::LOCK_BIT) & 1 == 1,
    }
}

fn encode_term(
    mut value: u64,
    term: &PowerTerm,
    power_shift: u32,
    enable_bit: u32,
    time_shift: u32,
    units: &RaplUnits,
) -> u64 {
    if term.power >= 0.0 {
        let raw = (term.power.min(units.max_watts()) * units.power_unit).round() as u64;
        value = (value & !(power::POWER_MASK << power_shift))
            | ((raw & power::POWER_MASK) << power_shift);
    }
    if term.time_window > 0.0 {
        let field = u64::from(encode_time_window(term.time_window, units.time_unit));
        value = (value & !(power::TIME_FIELD_MASK << time_shift)) | (field << time_shift);
    }
    if term.enabled {
        value | (1 << enable_bit)
    } else {
        value & !(1 << enable_bit)
    }
}

/// Merge `spec` into the current register word
pub fn encode_power_limit(current: u64, spec: &PowerLimitSpec, units: &RaplUnits) -> u64 {
    let value = encode_term(
        current,
        &spec.short_term,
        power::SHORT_POWER_SHIFT,
        power::SHORT_ENABLE_BIT,
        power::SHORT_TIME_SHIFT,
        units,
    );
    encode_term(
        value,
        &spec.long_term,
        power::LONG_POWER_SHIFT,
        power::LONG_ENABLE_BIT,
        power::LONG_TIME_SHIFT,
        units,
    )
}

/// Outcome of reading or applying one domain's limits
#[derive(Debug, Clone, PartialEq)]
pub struct PowerLimitReport {
    pub domain: String,
    pub reading: PowerLimitReading,
    /// MSR and MMIO copies hold different words
    pub copies_disagree: bool,
}

impl fmt::Display for PowerLimitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.copies_disagree {
            writeln!(f, "Warning: MSR and memory values are not equal")?;
        }
        if self.reading.locked {
            writeln!(f, "Warning: {} power limit is locked", self.domain)?;
        }
        let term = |f: &mut fmt::Formatter<'_>, label: &str, t: &PowerTermReading| {
            write!(
                f,
                "{} term {} power: {:.0} W, {:.3} s, {}",
                label,
                self.domain,
                t.watts.trunc(),
                t.seconds,
                if t.enabled { "enabled" } else { "disabled" }
            )
        };
        term(f, "Short", &self.reading.short_term)?;
        writeln!(f)?;
        term(f, "Long", &self.reading.long_term)
    }
}

/// The two copies of one domain's register
struct Copies<'a, R: ?Sized, M: ?Sized> {
    domain: &'a PowerDomainInfo,
    regs: &'a mut R,
    mmio: Option<&'a mut M>,
}

impl<R: RegisterFile + ?Sized, M: MmioAccess + ?Sized> Copies<'_, R, M> {
    fn mmio(&mut self) -> Result<&mut M> {
        let name = self.domain.name;
        self.mmio.as_deref_mut().ok_or_else(|| {
            UndervoltError::HardwareNotFound(format!("{} MMIO window is not mapped", name))
        })
    }

    fn offset(&self) -> usize {
        (self.domain.mem_addr & mmio::MAP_MASK) as usize
    }

    /// Read (msr, mem); a missing copy mirrors the other one
    fn read(&mut self) -> Result<(u64, u64)> {
        let msr = if self.domain.msr_addr != 0 {
            Some(self.regs.read(Msr(self.domain.msr_addr))?)
        } else {
            None
        };
        let mem = if self.domain.mem_addr != 0 {
            let offset = self.offset();
            Some(self.mmio()?.read_u64(offset)?)
        } else {
            None
        };
        match (msr, mem) {
            (Some(m), Some(p)) => Ok((m, p)),
            (Some(m), None) => Ok((m, m)),
            (None, Some(p)) => Ok((p, p)),
            (None, None) => Err(UndervoltError::NotSupported(format!(
                "no method available for {} power limits",
                self.domain.name
            ))),
        }
    }

    fn write(&mut self, value: u64) -> Result<()> {
        if self.domain.msr_addr != 0 {
            self.regs.write(Msr(self.domain.msr_addr), value)?;
        }
        if self.domain.mem_addr != 0 {
            let offset = self.offset();
            self.mmio()?.write_u64(offset, value)?;
        }
        Ok(())
    }
}

/// Read, and optionally rewrite, one domain's power limits.
///
/// The MSR copy is the one reported. Disagreement between the copies and a
/// locked register are surfaced in the report, not as errors.
pub fn apply_power_limit<R, M>(
    domain: &PowerDomainInfo,
    spec: &PowerLimitSpec,
    regs: &mut R,
    mmio: Option<&mut M>,
    write: bool,
) -> Result<PowerLimitReport>
where
    R: RegisterFile + ?Sized,
    M: MmioAccess + ?Sized,
{
    let mut copies = Copies { domain, regs, mmio };

    let (msr_value, mem_value) = copies.read()?;
    let units = RaplUnits::from_register(copies.regs.read(Msr::RAPL_POWER_UNIT)?);
    debug!(
        domain = domain.name,
        "power limit {:#018x} / {:#018x}, units {:?}", msr_value, mem_value, units
    );

    let (msr_value, mem_value) = if write {
        let value = encode_power_limit(msr_value, spec, &units);
        copies.write(value)?;
        let (msr_after, mem_after) = copies.read()?;
        if msr_after != value {
            warn!(
                domain = domain.name,
                "power limit not persisted (wrote {:#018x}, read {:#018x})", value, msr_after
            );
        }
        (msr_after, mem_after)
    } else {
        (msr_value, mem_value)
    };

    Ok(PowerLimitReport {
        domain: domain.name.to_string(),
        reading: decode_power_limit(msr_value, &units),
        copies_disagree: msr_value != mem_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::POWER_DOMAINS;
    use crate::hw::{MockMmioAccess, MockRegisterFile};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    const E2E_UNITS: u64 = 0x000a_0003;

    fn units() -> RaplUnits {
        RaplUnits::from_register(E2E_UNITS)
    }

    fn term(power: f64, time_window: f64) -> PowerTerm {
        PowerTerm {
            power,
            time_window,
            enabled: true,
        }
    }

    #[test]
    fn test_units_from_register() {
        let u = units();
        assert_eq!(u.power_unit, 8.0);
        assert_eq!(u.time_unit, 1024.0);
        assert_eq!(u.max_watts(), 0x7fff as f64 / 8.0);
    }

    #[test]
    fn test_time_window_roundtrip_within_quantization() {
        let tu = 1024.0;
        for seconds in [0.5, 1.0, 2.5, 10.0, 28.0, 56.0, 100.0, 1000.0] {
            let decoded = decode_time_window(encode_time_window(seconds, tu), tu);
            let rel = (decoded - seconds).abs() / seconds;
            assert!(rel <= 0.125, "{} s decoded as {} s", seconds, decoded);
        }
        assert_eq!(encode_time_window(10.0, tu), 0x5a);
        assert_eq!(encode_time_window(28.0, tu), 0xdc);
    }

    #[test]
    fn test_time_window_saturates() {
        // log2(s * tu / 1.75) >= 31
        let seconds = (1u64 << 31) as f64 * 1.75 / 1024.0;
        assert_eq!(encode_time_window(seconds, 1024.0), power::TIME_SATURATED);
        assert_eq!(encode_time_window(seconds * 4.0, 1024.0), power::TIME_SATURATED);
        assert_ne!(encode_time_window(seconds / 2.0, 1024.0), power::TIME_SATURATED);
    }

    #[test]
    fn test_end_to_end_package_encoding() {
        let spec = PowerLimitSpec {
            short_term: term(20.0, 10.0),
            long_term: term(15.0, 28.0),
        };
        let value = encode_power_limit(0, &spec, &units());

        assert_eq!((value >> 32) & 0x7fff, 160);
        assert_eq!(value & 0x7fff, 120);

        let reading = decode_power_limit(value, &units());
        assert_eq!(reading.short_term.watts, 20.0);
        assert_eq!(reading.long_term.watts, 15.0);
        assert!((reading.short_term.seconds - 10.0).abs() <= 10.0 * 0.125);
        assert!((reading.long_term.seconds - 28.0).abs() <= 28.0 * 0.125);
        assert!(reading.short_term.enabled && reading.long_term.enabled);
        assert!(!reading.locked);
    }

    #[test]
    fn test_encoding_is_idempotent() {
        let spec = PowerLimitSpec {
            short_term: term(35.0, 2.5),
            long_term: term(25.0, 28.0),
        };
        let once = encode_power_limit(0x8000_0000_0001_0000, &spec, &units());
        assert_eq!(encode_power_limit(once, &spec, &units()), once);
    }

    #[test]
    fn test_unset_terms_keep_register_bits() {
        let current = 0x8042_8118_00dd_8118;
        let spec = PowerLimitSpec {
            short_term: PowerTerm { power: -1.0, time_window: -1.0, enabled: true },
            long_term: PowerTerm { power: -1.0, time_window: 0.0, enabled: true },
        };
        // Enable bits are already set, lock and clamp bits must survive
        assert_eq!(encode_power_limit(current, &spec, &units()), current);

        let spec = PowerLimitSpec {
            short_term: PowerTerm { power: 30.0, time_window: -1.0, enabled: false },
            long_term: PowerTerm { power: -1.0, time_window: 0.0, enabled: true },
        };
        let value = encode_power_limit(current, &spec, &units());
        assert_eq!((value >> 32) & 0x7fff, 240);
        assert_eq!((value >> 47) & 1, 0);
        assert_eq!(value & 0xffff_ffff, current & 0xffff_ffff);
        assert_eq!(value >> 48, current >> 48);
    }

    #[test]
    fn test_time_window_without_power_keeps_power_bits() {
        let current = 0x0056_8118_00dc_80c8;
        let spec = PowerLimitSpec {
            short_term: PowerTerm { power: -1.0, time_window: 10.0, enabled: true },
            long_term: PowerTerm { power: -1.0, time_window: 10.0, enabled: true },
        };
        let value = encode_power_limit(current, &spec, &units());

        assert_eq!(value & 0x7fff, current & 0x7fff);
        assert_eq!((value >> 32) & 0x7fff, (current >> 32) & 0x7fff);
        assert_eq!((value >> 16) & 0xfe, 0x5a);
        assert_eq!((value >> 48) & 0xfe, 0x5a);
        assert_ne!((current >> 16) & 0xfe, 0x5a);
        assert_ne!((current >> 48) & 0xfe, 0x5a);

        let reading = decode_power_limit(value, &units());
        assert_eq!(reading.short_term.watts, 35.0);
        assert_eq!(reading.long_term.watts, 25.0);
        assert_eq!(reading.short_term.seconds, reading.long_term.seconds);
    }

    #[test]
    fn test_power_saturates_at_field_width() {
        let spec = PowerLimitSpec {
            short_term: term(100_000.0, -1.0),
            long_term: term(0.0, -1.0),
        };
        let value = encode_power_limit(0, &spec, &units());
        assert_eq!((value >> 32) & 0x7fff, 0x7fff);
        assert_eq!(value & 0x7fff, 0);
    }

    #[test]
    fn test_apply_writes_both_copies() {
        let domain = POWER_DOMAINS[0];
        let spec = PowerLimitSpec {
            short_term: term(20.0, 10.0),
            long_term: term(15.0, 28.0),
        };
        let expected = encode_power_limit(0, &spec, &units());

        let msr_word = Arc::new(AtomicU64::new(0));
        let mut regs = MockRegisterFile::new();
        let w = msr_word.clone();
        regs.expect_write()
            .withf(|msr, _| *msr == Msr::PKG_POWER_LIMIT)
            .times(1)
            .returning(move |_, v| {
                w.store(v, Ordering::SeqCst);
                Ok(())
            });
        let r = msr_word.clone();
        regs.expect_read().returning(move |msr| match msr {
            Msr::RAPL_POWER_UNIT => Ok(E2E_UNITS),
            _ => Ok(r.load(Ordering::SeqCst)),
        });

        let mem_word = Arc::new(AtomicU64::new(0));
        let mut window = MockMmioAccess::new();
        let w = mem_word.clone();
        window
            .expect_write_u64()
            .withf(|off, _| *off == 0x9a0)
            .times(1)
            .returning(move |_, v| {
                w.store(v, Ordering::SeqCst);
                Ok(())
            });
        let r = mem_word.clone();
        window.expect_read_u64().returning(move |_| Ok(r.load(Ordering::SeqCst)));

        let report = apply_power_limit(&domain, &spec, &mut regs, Some(&mut window), true).unwrap();
        assert_eq!(msr_word.load(Ordering::SeqCst), expected);
        assert_eq!(mem_word.load(Ordering::SeqCst), expected);
        assert!(!report.copies_disagree);
        assert_eq!(report.reading.short_term.watts, 20.0);
        assert!(report.to_string().contains("Short term package power: 20 W, 10.000 s, enabled"));
    }

    #[test]
    fn test_read_reports_disagreement_and_lock() {
        let domain = POWER_DOMAINS[0];
        let spec = PowerLimitSpec {
            short_term: term(-1.0, -1.0),
            long_term: term(-1.0, -1.0),
        };
        let mut regs = MockRegisterFile::new();
        regs.expect_write().never();
        regs.expect_read().returning(|msr| match msr {
            Msr::RAPL_POWER_UNIT => Ok(E2E_UNITS),
            _ => Ok(0x8000_0000_0000_00a0),
        });
        let mut window = MockMmioAccess::new();
        window.expect_read_u64().returning(|_| Ok(0x00a0));

        let report =
            apply_power_limit(&domain, &spec, &mut regs, Some(&mut window), false).unwrap();
        assert!(report.copies_disagree);
        assert!(report.reading.locked);
        let text = report.to_string();
        assert!(text.contains("not equal"));
        assert!(text.contains("locked"));
    }

    #[test]
    fn test_unmapped_window_fails_domain() {
        let domain = POWER_DOMAINS[0];
        let spec = PowerLimitSpec {
            short_term: term(20.0, -1.0),
            long_term: term(15.0, -1.0),
        };
        let mut regs = MockRegisterFile::new();
        regs.expect_read().returning(|_| Ok(0));
        regs.expect_write().never();

        let err = apply_power_limit(&domain, &spec, &mut regs, None::<&mut MockMmioAccess>, true)
            .unwrap_err();
        assert!(matches!(err, UndervoltError::HardwareNotFound(_)));
    }

    #[test]
    fn test_domain_without_any_copy() {
        let domain = PowerDomainInfo { name: "ghost", mem_addr: 0, msr_addr: 0 };
        let spec = PowerLimitSpec {
            short_term: term(20.0, -1.0),
            long_term: term(15.0, -1.0),
        };
        let mut regs = MockRegisterFile::new();
        let err =
            apply_power_limit(&domain, &spec, &mut regs, None::<&mut MockMmioAccess>, false)
                .unwrap_err();
        assert!(matches!(err, UndervoltError::NotSupported(_)));
    }
}
