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

//! Logging initialization
//!
//! One-shot commands log to stderr so their reports on stdout stay clean.
//! The daemon prefers the systemd journal when one is listening.

use std::path::Path;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directive
pub const LOG_ENV: &str = "INTEL_UNDERVOLT_LOG";

const DEFAULT_LEVEL: &str = "info";
const JOURNAL_SOCKET: &str = "/run/systemd/journal/socket";

/// Where log records end up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    Journal,
}

fn filter() -> EnvFilter {
    let directive = std::env::var(LOG_ENV).unwrap_or_else(|_| DEFAULT_LEVEL.to_string());
    EnvFilter::try_new(&directive).unwrap_or_else(|e| {
        eprintln!("Invalid {} value '{}': {}, using '{}'", LOG_ENV, directive, e, DEFAULT_LEVEL);
        EnvFilter::new(DEFAULT_LEVEL)
    })
}

fn init_stderr() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter())
        .init();
}

/// Install the global subscriber. `daemon` enables the journal.
pub fn init(daemon: bool) -> LogTarget {
    if !daemon || !Path::new(JOURNAL_SOCKET).exists() {
        init_stderr();
        return LogTarget::Stderr;
    }

    match tracing_journald::layer() {
        Ok(journald_layer) => {
            tracing_subscriber::registry()
                .with(journald_layer)
                .with(filter())
                .init();
            LogTarget::Journal
        }
        Err(e) => {
            eprintln!("Failed to create journald layer: {}, falling back to stderr", e);
            init_stderr();
            LogTarget::Stderr
        }
    }
}
