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

//! Daemon mode
//!
//! Re-applies the configured actions every interval and drives the HWP hint
//! policy engine. `SIGUSR1` requests a configuration reload, which happens at
//! the top of the next iteration.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::SIGUSR1;
use tracing::{debug, info, warn};

use iu_core::{
    ActionKind, Config, HintStore, PassSummary, PolicyEngine, SamplerTelemetry, SysfsHintStore,
    TelemetrySource,
};
use iu_error::{Result, UndervoltError};

use crate::apply::{DeviceProvider, Session, SystemDevices};
use crate::config::{daemon_interval, load_config};

/// Reload request flag, set from `SIGUSR1` once installed
#[derive(Debug, Clone, Default)]
pub struct ReloadSignal {
    flag: Arc<AtomicBool>,
}

impl ReloadSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `SIGUSR1` to a fresh flag
    pub fn install() -> Result<Self> {
        let signal = Self::new();
        signal_hook::flag::register(SIGUSR1, Arc::clone(&signal.flag))
            .map_err(|e| UndervoltError::io("SIGUSR1 handler", e))?;
        debug!("Installed SIGUSR1 reload handler");
        Ok(signal)
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Consume a pending request
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

pub type ConfigLoader = Box<dyn FnMut() -> Result<Config>>;
pub type EngineBuilder<S, T> = Box<dyn FnMut() -> Result<PolicyEngine<S, T>>>;

/// What one iteration did
#[derive(Debug, Default)]
pub struct StepReport {
    pub reloaded: bool,
    /// Action kinds that ran, in order
    pub actions: Vec<ActionKind>,
    pub failures: usize,
    /// Set when the policy engine ran
    pub hints: Option<PassSummary>,
}

pub struct Daemon<P: DeviceProvider, S, T> {
    session: Session<P>,
    config: Config,
    interval: Duration,
    loader: ConfigLoader,
    build_engine: EngineBuilder<S, T>,
    engine: Option<PolicyEngine<S, T>>,
    reload: ReloadSignal,
    /// `once` actions already run; kept across reloads
    completed_once: HashSet<ActionKind>,
}

impl<P, S, T> Daemon<P, S, T>
where
    P: DeviceProvider,
    S: HintStore,
    T: TelemetrySource,
{
    /// Load the first snapshot and open its devices
    pub fn new(
        provider: P,
        mut loader: ConfigLoader,
        build_engine: EngineBuilder<S, T>,
        reload: ReloadSignal,
    ) -> Result<Self> {
        let config = loader()?;
        let interval = daemon_interval(&config)?;
        let mut session = Session::new(provider);
        session.prepare(&config)?;

        Ok(Self {
            session,
            config,
            interval,
            loader,
            build_engine,
            engine: None,
            reload,
            completed_once: HashSet::new(),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Session<P> {
        &self.session
    }

    pub fn has_engine(&self) -> bool {
        self.engine.is_some()
    }

    fn reload_config(&mut self) -> Result<()> {
        info!("Reloading configuration");
        let config = (self.loader)()?;
        let interval = daemon_interval(&config)?;
        self.session.prepare(&config)?;
        self.config = config;
        self.interval = interval;
        Ok(())
    }

    /// One iteration without the sleep. Only a failed reload is an error.
    pub fn step(&mut self) -> Result<StepReport> {
        let mut report = StepReport::default();

        if self.reload.take() {
            self.reload_config()?;
            report.reloaded = true;
        }

        let actions = self.config.effective_daemon_actions().to_vec();
        for action in actions {
            if action.once && !self.completed_once.insert(action.kind) {
                continue;
            }
            let reports = self.session.run_action(&self.config, action.kind, true);
            report.failures += reports.iter().filter(|r| !r.is_ok()).count();
            report.actions.push(action.kind);
        }

        if self.config.hint_rules.is_empty() {
            if self.engine.take().is_some() {
                info!("HWP hint rules removed, policy engine stopped");
            }
        } else {
            if self.engine.is_none() {
                match (self.build_engine)() {
                    Ok(engine) => {
                        info!(cores = engine.core_count(), "Policy engine started");
                        self.engine = Some(engine);
                    }
                    Err(e) => warn!("Failed to start policy engine: {}", e),
                }
            }
            if let Some(engine) = self.engine.as_mut() {
                report.hints = Some(engine.update(&self.config.hint_rules));
            }
        }

        if report.failures > 0 {
            debug!(failures = report.failures, "Iteration finished with errors");
        }
        Ok(report)
    }

    /// Iterate until `shutdown` is set or a reload fails
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        info!(interval_ms = self.interval.as_millis() as u64, "Daemon started");
        while !shutdown.load(Ordering::SeqCst) {
            self.step()?;
            std::thread::sleep(self.interval);
        }
        info!("Daemon stopped");
        Ok(())
    }
}

/// Run the daemon against the real devices
pub fn run_daemon(config_path: &Path, shutdown: &AtomicBool) -> Result<()> {
    let reload = ReloadSignal::install()?;
    let path = config_path.to_path_buf();
    let loader: ConfigLoader = Box::new(move || load_config(&path));
    let build_engine: EngineBuilder<SysfsHintStore, SamplerTelemetry> =
        Box::new(|| Ok(PolicyEngine::new(SysfsHintStore::new()?, SamplerTelemetry::new())));

    let mut daemon = Daemon::new(SystemDevices, loader, build_engine, reload)?;
    daemon.run(shutdown)
}
