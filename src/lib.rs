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

//! intel-undervolt - register-level tuning of Intel CPUs on Linux
//!
//! The binary's building blocks: the configuration loader, the apply
//! orchestrator for one-shot and daemon modes, and the live telemetry readout.

pub mod apply;
pub mod config;
pub mod daemon;
pub mod logging;
pub mod measure;

#[cfg(test)]
pub mod test_utils;
