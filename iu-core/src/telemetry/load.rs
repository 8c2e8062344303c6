//! CPU load from `/proc/stat`
//!
//! Per-core load is the busy share of the time elapsed between two reads of
//! the cpu time table.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::constants::{paths, telemetry};
use crate::error::{Result, UndervoltError};

/// Load figures of one measurement
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadSample {
    /// Busiest core, 0.0-1.0
    pub single_core: f64,
    /// Sum over all cores, 0.0-core count
    pub multi_core: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CoreTimes {
    idle: u64,
    total: u64,
}

/// Parse a `cpuN ...` line; the aggregate `cpu` line and short lines are skipped
fn parse_core_line(line: &str) -> Option<(usize, CoreTimes)> {
    let mut fields = line.split_whitespace();
    let index = fields.next()?.strip_prefix("cpu")?.parse::<usize>().ok()?;

    let values: Vec<u64> = fields.map_while(|v| v.parse::<u64>().ok()).collect();
    if values.len() < telemetry::MIN_FIELDS {
        return None;
    }
    Some((
        index,
        CoreTimes {
            idle: values[telemetry::IDLE_FIELD],
            total: values.iter().sum(),
        },
    ))
}

/// Stateful `/proc/stat` reader
#[derive(Debug)]
pub struct CpuLoadSampler {
    path: PathBuf,
    previous: Vec<Option<CoreTimes>>,
}

impl CpuLoadSampler {
    pub fn new() -> Result<Self> {
        Self::with_path(Path::new(paths::PROC_STAT))
    }

    /// Discover cores from `path`; the core set stays fixed afterwards
    pub fn with_path(path: &Path) -> Result<Self> {
        let content = Self::read(path)?;
        let cores = content
            .lines()
            .filter_map(|line| {
                let name = line.split_whitespace().next()?;
                name.strip_prefix("cpu")?.parse::<usize>().ok()
            })
            .max()
            .map(|highest| highest + 1)
            .ok_or_else(|| {
                let message = format!("no cpu lines in {}", path.display());
                UndervoltError::HardwareNotFound(message)
            })?;

        debug!("Discovered {} cores in {}", cores, path.display());
        Ok(Self {
            path: path.to_path_buf(),
            previous: vec![None; cores],
        })
    }

    pub fn core_count(&self) -> usize {
        self.previous.len()
    }

    fn read(path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|source| UndervoltError::FileRead {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Re-read the table and return load since the previous call
    pub fn measure(&mut self) -> Result<LoadSample> {
        let content = Self::read(&self.path)?;
        Ok(self.update(&content))
    }

    fn update(&mut self, content: &str) -> LoadSample {
        let mut sample = LoadSample::default();

        for (index, now) in content.lines().filter_map(parse_core_line) {
            let Some(slot) = self.previous.get_mut(index) else {
                continue;
            };
            if let Some(before) = slot.replace(now) {
                let total = now.total.saturating_sub(before.total);
                if total > 0 {
                    let idle = now.idle.saturating_sub(before.idle).min(total);
                    let load = 1.0 - idle as f64 / total as f64;
                    sample.single_core = sample.single_core.max(load);
                    sample.multi_core += load;
                }
            }
        }

        trace!("load single={:.3} multi={:.3}", sample.single_core, sample.multi_core);
        sample
    }
}
