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

//! Shared fixtures for unit tests

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::rc::Rc;

use tempfile::TempDir;

use iu_core::{MmioAccess, Msr, RegisterFile};
use iu_error::{Result, UndervoltError};

use crate::apply::DeviceProvider;

/// Power unit 1/8 W, time unit 1/1024 s
pub const RAPL_UNITS: u64 = 0x000a_0003;

/// PL1 25 W / 28 s, PL2 35 W / 2.5 s, both enabled
pub const PACKAGE_LIMIT: u64 = 0x0056_8118_00dc_80c8;

const PLANE_SHIFT: u32 = 40;
const PLANE_MASK: u64 = 0x7;
const WRITE_COMMAND: u64 = 0x1_0000_0000;
const LOW_WORD: u64 = 0xffff_ffff;

#[derive(Debug, Default)]
struct FakeState {
    registers: HashMap<u32, u64>,
    /// Offset word per voltage plane
    planes: HashMap<u8, u64>,
    selected_plane: u8,
    window: u64,
    failing: HashSet<u32>,
    fail_open: bool,
    opens: usize,
    maps: usize,
}

/// In-memory MSRs and MMIO mirror, shared by every handle it hands out
#[derive(Debug, Clone)]
pub struct FakeDevices {
    state: Rc<RefCell<FakeState>>,
}

impl FakeDevices {
    pub fn new() -> Self {
        let mut state = FakeState::default();
        state.registers.insert(Msr::RAPL_POWER_UNIT.address(), RAPL_UNITS);
        state.registers.insert(Msr::PKG_POWER_LIMIT.address(), PACKAGE_LIMIT);
        state.registers.insert(Msr::TEMPERATURE_TARGET.address(), 0);
        state.window = PACKAGE_LIMIT;
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn register(&self, address: u32) -> u64 {
        self.state.borrow().registers.get(&address).copied().unwrap_or(0)
    }

    pub fn window_value(&self) -> u64 {
        self.state.borrow().window
    }

    pub fn fail_register(&self, address: u32) {
        self.state.borrow_mut().failing.insert(address);
    }

    pub fn fail_open(&self, fail: bool) {
        self.state.borrow_mut().fail_open = fail;
    }

    pub fn opens(&self) -> usize {
        self.state.borrow().opens
    }

    pub fn maps(&self) -> usize {
        self.state.borrow().maps
    }

    /// Offset word last written for `plane`
    pub fn plane_offset(&self, plane: u8) -> Option<u64> {
        self.state.borrow().planes.get(&plane).copied()
    }
}

fn injected(msr: Msr) -> UndervoltError {
    UndervoltError::io(msr.to_string(), io::Error::from(io::ErrorKind::BrokenPipe))
}

struct FakeRegisters {
    state: Rc<RefCell<FakeState>>,
}

impl RegisterFile for FakeRegisters {
    fn read(&mut self, msr: Msr) -> Result<u64> {
        let state = self.state.borrow();
        if state.failing.contains(&msr.address()) {
            return Err(injected(msr));
        }
        if msr == Msr::VOLTAGE {
            let plane = state.selected_plane;
            let offset = state.planes.get(&plane).copied().unwrap_or(0);
            return Ok((u64::from(plane) << PLANE_SHIFT) | offset);
        }
        Ok(state.registers.get(&msr.address()).copied().unwrap_or(0))
    }

    fn write(&mut self, msr: Msr, value: u64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.failing.contains(&msr.address()) {
            return Err(injected(msr));
        }
        if msr == Msr::VOLTAGE {
            let plane = ((value >> PLANE_SHIFT) & PLANE_MASK) as u8;
            state.selected_plane = plane;
            if value & WRITE_COMMAND != 0 {
                state.planes.insert(plane, value & LOW_WORD);
            }
            return Ok(());
        }
        state.registers.insert(msr.address(), value);
        Ok(())
    }
}

struct FakeWindow {
    state: Rc<RefCell<FakeState>>,
    phys_addr: u64,
}

impl MmioAccess for FakeWindow {
    fn address(&self) -> u64 {
        self.phys_addr
    }

    fn read_u64(&mut self, _offset: usize) -> Result<u64> {
        Ok(self.state.borrow().window)
    }

    fn write_u64(&mut self, _offset: usize, value: u64) -> Result<()> {
        self.state.borrow_mut().window = value;
        Ok(())
    }
}

impl DeviceProvider for FakeDevices {
    fn open_registers(&mut self) -> Result<Box<dyn RegisterFile>> {
        let mut state = self.state.borrow_mut();
        if state.fail_open {
            return Err(UndervoltError::PermissionOrUnavailable {
                device: "/dev/cpu/0/msr".into(),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            });
        }
        state.opens += 1;
        Ok(Box::new(FakeRegisters {
            state: Rc::clone(&self.state),
        }))
    }

    fn map_window(&mut self, phys_addr: u64) -> Result<Box<dyn MmioAccess>> {
        self.state.borrow_mut().maps += 1;
        Ok(Box::new(FakeWindow {
            state: Rc::clone(&self.state),
            phys_addr,
        }))
    }
}

/// `policyN/energy_performance_preference` tree
pub fn create_cpufreq_dir(hints: &[&str]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (index, hint) in hints.iter().enumerate() {
        let policy = dir.path().join(format!("policy{}", index));
        fs::create_dir(&policy).unwrap();
        fs::write(policy.join("energy_performance_preference"), format!("{}\n", hint)).unwrap();
    }
    dir
}

pub fn read_hints(dir: &TempDir, cores: usize) -> Vec<String> {
    (0..cores)
        .map(|index| {
            let path = dir
                .path()
                .join(format!("policy{}", index))
                .join("energy_performance_preference");
            fs::read_to_string(path).unwrap().trim().to_string()
        })
        .collect()
}

/// powercap tree with one `intel-rapl:N` zone per name
pub fn create_powercap_dir(zones: &[(&str, u64)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (index, (name, energy)) in zones.iter().enumerate() {
        let zone = dir.path().join(format!("intel-rapl:{}", index));
        fs::create_dir(&zone).unwrap();
        fs::write(zone.join("name"), format!("{}\n", name)).unwrap();
        fs::write(zone.join("energy_uj"), format!("{}\n", energy)).unwrap();
    }
    dir
}

/// `/proc/stat` style table: (idle, busy) jiffies per core
pub fn stat_content(cores: &[(u64, u64)]) -> String {
    let mut out = String::from("cpu  0 0 0 0 0 0 0 0 0 0\n");
    for (index, (idle, busy)) in cores.iter().enumerate() {
        out.push_str(&format!("cpu{} {} 0 0 {} 0 0 0 0 0 0\n", index, busy, idle));
    }
    out.push_str("intr 0\nctxt 0\n");
    out
}

pub fn assert_approx_eq(a: f64, b: f64, tolerance: f64) {
    assert!((a - b).abs() <= tolerance, "{} and {} differ by more than {}", a, b, tolerance);
}

#[cfg(test)]
mod tests {
    use super::*;
    use iu_core::codec::undervolt::{read_request, write_request};

    #[test]
    fn test_fake_mailbox_reports_selected_plane() {
        let devices = FakeDevices::new();
        let mut provider = devices.clone();
        let mut regs = provider.open_registers().unwrap();

        regs.write(Msr::VOLTAGE, write_request(2, -50.0)).unwrap();
        regs.write(Msr::VOLTAGE, read_request(0)).unwrap();
        assert_eq!(regs.read(Msr::VOLTAGE).unwrap() & LOW_WORD, 0);

        regs.write(Msr::VOLTAGE, read_request(2)).unwrap();
        let value = regs.read(Msr::VOLTAGE).unwrap();
        assert_eq!(value & LOW_WORD, write_request(2, -50.0) & LOW_WORD);
        assert_eq!(devices.plane_offset(2), Some(value & LOW_WORD));
    }

    #[test]
    fn test_stat_content_shape() {
        let content = stat_content(&[(90, 10), (50, 50)]);
        assert!(content.contains("cpu1 50 0 0 50"));
        assert_eq!(content.lines().filter(|l| l.starts_with("cpu")).count(), 3);
    }
}
