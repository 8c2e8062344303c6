//! HWP energy performance preference access through cpufreq policies

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::constants::paths;
use crate::error::{Result, UndervoltError};

/// Per-core hint storage
#[cfg_attr(test, mockall::automock)]
pub trait HintStore {
    fn core_count(&self) -> usize;
    fn read_hint(&mut self, core: usize) -> Result<String>;
    fn write_hint(&mut self, core: usize, hint: &str) -> Result<()>;
}

/// `policyN/energy_performance_preference` files under a cpufreq directory
#[derive(Debug)]
pub struct SysfsHintStore {
    root: PathBuf,
    cores: usize,
}

impl SysfsHintStore {
    pub fn new() -> Result<Self> {
        Self::with_root(Path::new(paths::CPUFREQ_DIR))
    }

    /// Core count is the highest `policyN` plus one
    pub fn with_root(root: &Path) -> Result<Self> {
        let entries = fs::read_dir(root).map_err(|source| UndervoltError::FileRead {
            path: root.to_path_buf(),
            source,
        })?;

        let cores = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_str()?
                    .strip_prefix("policy")?
                    .parse::<usize>()
                    .ok()
            })
            .max()
            .map(|highest| highest + 1)
            .ok_or_else(|| {
                let message = format!("no cpufreq policies in {}", root.display());
                UndervoltError::HardwareNotFound(message)
            })?;

        debug!("Discovered {} cpufreq policies", cores);
        Ok(Self {
            root: root.to_path_buf(),
            cores,
        })
    }

    fn hint_path(&self, core: usize) -> PathBuf {
        self.root.join(format!("policy{}", core)).join(paths::HINT_FILE)
    }
}

impl HintStore for SysfsHintStore {
    fn core_count(&self) -> usize {
        self.cores
    }

    fn read_hint(&mut self, core: usize) -> Result<String> {
        let path = self.hint_path(core);
        let content = fs::read_to_string(&path)
            .map_err(|source| UndervoltError::FileRead { path, source })?;
        Ok(content.strip_suffix('\n').unwrap_or(&content).to_string())
    }

    fn write_hint(&mut self, core: usize, hint: &str) -> Result<()> {
        let path = self.hint_path(core);
        let label = format!("policy{} hint", core);
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| UndervoltError::io(label.as_str(), e))?;
        file.write_all(hint.as_bytes())
            .map_err(|e| UndervoltError::io(label, e))
    }
}
