//! Physical memory windows
//!
//! A window maps the 4 KiB page of `/dev/mem` containing a register mirror.
//! Loads and stores never touch the mapping directly: the kernel copies the
//! 8 bytes through a pipe, so a machine-check or bus error on the window comes
//! back as `EFAULT` instead of a signal.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::constants::{mmio, paths};
use crate::error::{Result, UndervoltError};

/// Process-wide slot held for the duration of one guarded access
static ACCESS_SLOT: AtomicBool = AtomicBool::new(false);

/// Scoped claim on the guarded access slot
#[derive(Debug)]
pub struct AccessGuard {
    _claim: (),
}

impl AccessGuard {
    /// Claim the slot, failing with `AccessBusy` if another access is in flight
    pub fn acquire() -> Result<Self> {
        ACCESS_SLOT
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| UndervoltError::AccessBusy)?;
        Ok(Self { _claim: () })
    }
}

impl Drop for AccessGuard {
    fn drop(&mut self) {
        ACCESS_SLOT.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// Load from the mapped address into the buffer
    FromMapping,
    /// Store the buffer to the mapped address
    ToMapping,
}

/// Copy 8 bytes between `addr` and `buf` with the kernel doing the access.
///
/// `target` and `phys` only label errors.
///
/// The kernel's user-copy routine moves the bytes, so the width and
/// alignment of the bus access are whatever that routine picks. A single
/// aligned 64-bit load or store is not guaranteed, and `addr` need not be
/// aligned at all.
///
/// # Safety
///
/// For [`CopyDirection::ToMapping`] the caller must own the memory at `addr`
/// for 8 bytes: the kernel validates the address range, not what lives there.
pub unsafe fn guarded_copy(
    addr: *mut u8,
    buf: &mut [u8; mmio::ACCESS_SIZE],
    direction: CopyDirection,
    target: &str,
    phys: u64,
) -> Result<()> {
    let _guard = AccessGuard::acquire()?;
    let (rd, wr) = pipe().map_err(|e| UndervoltError::io(target, e))?;

    let (src, dst) = match direction {
        CopyDirection::FromMapping => (addr as *const c_void, buf.as_mut_ptr() as *mut c_void),
        CopyDirection::ToMapping => (buf.as_ptr() as *const c_void, addr as *mut c_void),
    };

    let written = libc::write(wr.as_raw_fd(), src, mmio::ACCESS_SIZE);
    check_transfer(written, target, phys)?;
    let read = libc::read(rd.as_raw_fd(), dst, mmio::ACCESS_SIZE);
    check_transfer(read, target, phys)
}

fn check_transfer(ret: isize, target: &str, phys: u64) -> Result<()> {
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EFAULT) {
            return Err(UndervoltError::fault(target, phys));
        }
        return Err(UndervoltError::io(target, err));
    }
    if ret as usize != mmio::ACCESS_SIZE {
        return Err(UndervoltError::io(
            target,
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short transfer of {} bytes", ret),
            ),
        ));
    }
    Ok(())
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds has room for the two descriptors pipe2 fills in
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors are freshly created and owned by nobody else
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// 64-bit access to a mapped register window
///
/// Values are 64 bits wide; [`MmioWindow`] does not promise that the
/// hardware sees them as one access.
#[cfg_attr(test, mockall::automock)]
pub trait MmioAccess {
    /// Physical address the window was mapped for
    fn address(&self) -> u64;
    fn read_u64(&mut self, offset: usize) -> Result<u64>;
    fn write_u64(&mut self, offset: usize, value: u64) -> Result<()>;
}

/// One mapped page of physical memory
#[derive(Debug)]
pub struct MmioWindow {
    base: NonNull<u8>,
    phys_addr: u64,
    label: String,
}

impl MmioWindow {
    /// Map the page of `/dev/mem` that contains `phys_addr`
    pub fn map(phys_addr: u64) -> Result<Self> {
        Self::map_file(Path::new(paths::MEM_DEVICE), phys_addr)
    }

    /// Map the page containing `phys_addr` from any mappable file
    pub fn map_file(path: &Path, phys_addr: u64) -> Result<Self> {
        let file: File = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|source| UndervoltError::PermissionOrUnavailable {
                device: path.to_path_buf(),
                source,
            })?;

        let page = phys_addr & !mmio::MAP_MASK;
        let label = format!("MMIO {:#x}", phys_addr);

        // SAFETY: a fresh shared mapping; the kernel picks the address
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mmio::MAP_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                page as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(UndervoltError::io(label, io::Error::last_os_error()));
        }
        let base = NonNull::new(ptr as *mut u8).ok_or_else(|| {
            UndervoltError::io(label.clone(), io::Error::from(io::ErrorKind::Other))
        })?;

        debug!("Mapped {} at page {:#x}", label, page);
        Ok(Self {
            base,
            phys_addr,
            label,
        })
    }

    /// Offset of the mapped register inside the window
    pub fn register_offset(&self) -> usize {
        (self.phys_addr & mmio::MAP_MASK) as usize
    }

    fn slot(&self, offset: usize) -> Result<*mut u8> {
        if offset + mmio::ACCESS_SIZE > mmio::MAP_SIZE {
            return Err(UndervoltError::io(
                self.label.as_str(),
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("offset {:#x} outside window", offset),
                ),
            ));
        }
        // SAFETY: offset + 8 stays inside the MAP_SIZE mapping
        Ok(unsafe { self.base.as_ptr().add(offset) })
    }
}

impl MmioAccess for MmioWindow {
    fn address(&self) -> u64 {
        self.phys_addr
    }

    fn read_u64(&mut self, offset: usize) -> Result<u64> {
        let addr = self.slot(offset)?;
        let mut buf = [0u8; mmio::ACCESS_SIZE];
        // SAFETY: loads never modify process memory
        unsafe {
            guarded_copy(addr, &mut buf, CopyDirection::FromMapping, &self.label, self.phys_addr)?
        };
        Ok(u64::from_ne_bytes(buf))
    }

    fn write_u64(&mut self, offset: usize, value: u64) -> Result<()> {
        let addr = self.slot(offset)?;
        let mut buf = value.to_ne_bytes();
        // SAFETY: addr lies inside the mapping this window owns
        unsafe {
            guarded_copy(addr, &mut buf, CopyDirection::ToMapping, &self.label, self.phys_addr)
        }
    }
}

impl Drop for MmioWindow {
    fn drop(&mut self) {
        // SAFETY: base/MAP_SIZE are exactly what mmap returned
        if unsafe { libc::munmap(self.base.as_ptr() as *mut c_void, mmio::MAP_SIZE) } != 0 {
            warn!("Failed to unmap {}: {}", self.label, io::Error::last_os_error());
        } else {
            debug!("Unmapped {}", self.label);
        }
    }
}
