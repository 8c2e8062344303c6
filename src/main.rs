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

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use intel_undervolt::apply::{apply_values, read_values, ApplyOutcome};
use intel_undervolt::config::config_path;
use intel_undervolt::daemon::run_daemon;
use intel_undervolt::logging;
use intel_undervolt::measure::run_measure;

#[derive(Parser)]
#[command(name = "intel-undervolt")]
#[command(version)]
#[command(about = "Undervolting and power limits for Intel CPUs")]
#[command(long_about = "Undervolting and power limits for Intel CPUs

EXAMPLES:
    intel-undervolt read       Read and display current values
    intel-undervolt apply      Apply values from the configuration file
    intel-undervolt daemon     Re-apply values and switch HWP hints periodically
    intel-undervolt measure    Show package power and CPU load

ENVIRONMENT VARIABLES:
    INTEL_UNDERVOLT_CONFIG     Configuration file (default /etc/intel-undervolt.json)
    INTEL_UNDERVOLT_LOG=debug  Log filter

Send SIGUSR1 to a running daemon to reload its configuration.")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Read and display current values
    Read,
    /// Apply values from the configuration file
    Apply,
    /// Run in daemon mode
    Daemon,
    /// Measure power consumption and CPU load
    Measure,
}

fn print_outcome(outcome: &ApplyOutcome) -> bool {
    print!("{}", outcome);
    outcome.success
}

fn run(cli: Cli, shutdown: &AtomicBool) -> anyhow::Result<bool> {
    let path = config_path(cli.config.as_deref());
    match cli.command {
        Command::Read => {
            let outcome = read_values(&path)
                .with_context(|| format!("Failed to read values using {}", path.display()))?;
            Ok(print_outcome(&outcome))
        }
        Command::Apply => {
            let outcome = apply_values(&path)
                .with_context(|| format!("Failed to apply {}", path.display()))?;
            Ok(print_outcome(&outcome))
        }
        Command::Daemon => {
            info!("Using configuration {}", path.display());
            run_daemon(&path, shutdown).context("Daemon terminated")?;
            Ok(true)
        }
        Command::Measure => {
            run_measure(shutdown).context("Failed to measure power")?;
            Ok(true)
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // SAFETY: geteuid has no preconditions
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("Error: intel-undervolt requires root privileges to access CPU registers.");
        eprintln!(
            "Please run with: sudo {}",
            std::env::args().next().unwrap_or_else(|| "intel-undervolt".to_string())
        );
        std::process::exit(1);
    }

    let daemon = cli.command == Command::Daemon;
    let target = logging::init(daemon);
    if daemon {
        info!("intel-undervolt {} logging to {:?}", env!("CARGO_PKG_VERSION"), target);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received SIGINT/SIGTERM, exiting");
        handler_flag.store(true, Ordering::SeqCst);
        std::process::exit(0);
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    match run(cli, &shutdown) {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}
