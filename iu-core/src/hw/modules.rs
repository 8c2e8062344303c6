//! Kernel module loading
//!
//! Best effort: a missing modprobe or an unknown module is logged and reported
//! through the return value, never as an error.

use std::path::Path;
use std::process::Command;

use tracing::{debug, info};

use crate::constants::paths;

/// Run `modprobe <module>`, returning whether the module is now loaded
pub fn load_kernel_module(module: &str) -> bool {
    let program = if Path::new(paths::MODPROBE).exists() {
        paths::MODPROBE
    } else {
        "modprobe"
    };

    match Command::new(program).arg(module).output() {
        Ok(output) if output.status.success() => {
            info!("Loaded kernel module: {}", module);
            true
        }
        Ok(output) => {
            debug!(
                "Module {} not available: {}",
                module,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        Err(e) => {
            debug!("Could not run modprobe for {}: {}", module, e);
            false
        }
    }
}
