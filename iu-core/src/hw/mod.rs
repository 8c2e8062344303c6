//! Hardware interaction modules
//!
//! Privileged register access: model-specific registers through the msr
//! character device and physical memory windows through `/dev/mem`.

mod mmio;
pub mod modules;
mod msr;

pub use mmio::{guarded_copy, AccessGuard, CopyDirection, MmioAccess, MmioWindow};
pub use modules::load_kernel_module;
pub use msr::{Msr, MsrDevice, RegisterFile};

#[cfg(test)]
pub use mmio::MockMmioAccess;
#[cfg(test)]
pub use msr::MockRegisterFile;
