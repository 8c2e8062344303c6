//! Model-specific register access
//!
//! Registers are read and written through the msr character device, where the
//! file offset selects the register and every transfer is exactly 8 bytes.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::constants::{paths, MSR_MODULE};
use crate::error::{Result, UndervoltError};
use crate::hw::modules::load_kernel_module;

/// Model-specific register address.
///
/// Keeps register addresses apart from plane indices, bit positions and
/// physical addresses, which are all plain integers in this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Msr(pub u32);

impl Msr {
    /// Voltage plane offset mailbox.
    pub const VOLTAGE: Self = Self(0x150);

    /// TCC activation temperature target.
    pub const TEMPERATURE_TARGET: Self = Self(0x1a2);

    /// RAPL power, energy and time units.
    pub const RAPL_POWER_UNIT: Self = Self(0x606);

    /// Package RAPL power limit.
    pub const PKG_POWER_LIMIT: Self = Self(0x610);

    #[inline]
    pub const fn address(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Msr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MSR {:#x}", self.0)
    }
}

/// 64-bit register file addressed by [`Msr`]
///
/// Every codec talks to hardware through this seam.
#[cfg_attr(test, mockall::automock)]
pub trait RegisterFile {
    fn read(&mut self, msr: Msr) -> Result<u64>;
    fn write(&mut self, msr: Msr, value: u64) -> Result<()>;
}

/// Open handle on an msr character device
#[derive(Debug)]
pub struct MsrDevice {
    file: File,
    path: PathBuf,
}

impl MsrDevice {
    /// Open `/dev/cpu/0/msr`, loading the `msr` module if the node is missing
    pub fn open() -> Result<Self> {
        Self::open_with(Path::new(paths::MSR_DEVICE), Some(MSR_MODULE))
    }

    /// Open an arbitrary device node.
    ///
    /// When `module` is given and the first attempt fails with a permission or
    /// not-found error, the module is loaded once and the open retried.
    pub fn open_with(path: &Path, module: Option<&str>) -> Result<Self> {
        let unavailable = |source| UndervoltError::PermissionOrUnavailable {
            device: path.to_path_buf(),
            source,
        };

        let file = match (Self::open_file(path), module) {
            (Ok(file), _) => file,
            (Err(e), Some(module)) if Self::is_retryable(&e) => {
                debug!("Opening {} failed ({}), loading {} module", path.display(), e, module);
                load_kernel_module(module);
                Self::open_file(path).map_err(unavailable)?
            }
            (Err(e), _) => return Err(unavailable(e)),
        };

        debug!("Opened {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_file(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
    }

    fn is_retryable(e: &io::Error) -> bool {
        matches!(
            e.kind(),
            io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound
        )
    }
}

impl RegisterFile for MsrDevice {
    fn read(&mut self, msr: Msr) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.file
            .read_exact_at(&mut buf, u64::from(msr.address()))
            .map_err(|e| UndervoltError::io(msr.to_string(), e))?;
        let value = u64::from_ne_bytes(buf);
        trace!("read {} = {:#018x}", msr, value);
        Ok(value)
    }

    fn write(&mut self, msr: Msr, value: u64) -> Result<()> {
        trace!("write {} = {:#018x}", msr, value);
        self.file
            .write_all_at(&value.to_ne_bytes(), u64::from(msr.address()))
            .map_err(|e| UndervoltError::io(msr.to_string(), e))
    }
}
