//! HWP hint policy engine
//!
//! One pass walks the rules in order. A core belongs to the first rule that
//! governs it; later rules never see it again during that pass.
//!
//! # Laziness
//!
//! - Current hints are read the first time a switch rule is reached.
//! - A rule's predicate is evaluated only if the rule governs some core.
//! - Each sampler is read at most once per pass; rules share the sample.

use tracing::{debug, trace, warn};

use crate::data::{Combinator, Comparison, HintRule, LoadCapture, PowerCondition, Predicate};
use crate::engine::hints::HintStore;
use crate::telemetry::{domain_watts, CpuLoadSampler, DomainPower, EnergySampler, LoadSample};

/// Fresh telemetry for the policy engine; `None` = sampler unavailable
#[cfg_attr(test, mockall::automock)]
pub trait TelemetrySource {
    fn sample_load(&mut self) -> Option<LoadSample>;
    fn sample_power(&mut self) -> Option<Vec<DomainPower>>;
}

/// Telemetry backed by the real samplers
#[derive(Debug, Default)]
pub struct SamplerTelemetry {
    load: Option<CpuLoadSampler>,
    energy: Option<EnergySampler>,
}

impl SamplerTelemetry {
    /// Open both samplers; one failing leaves that source unavailable
    pub fn new() -> Self {
        let load = CpuLoadSampler::new()
            .map_err(|e| warn!("CPU load sampling unavailable: {}", e))
            .ok();
        let energy = EnergySampler::new()
            .map_err(|e| warn!("Energy sampling unavailable: {}", e))
            .ok();
        Self::from_samplers(load, energy)
    }

    pub fn from_samplers(load: Option<CpuLoadSampler>, energy: Option<EnergySampler>) -> Self {
        Self { load, energy }
    }
}

impl TelemetrySource for SamplerTelemetry {
    fn sample_load(&mut self) -> Option<LoadSample> {
        let sampler = self.load.as_mut()?;
        sampler
            .measure()
            .map_err(|e| warn!("Failed to sample CPU load: {}", e))
            .ok()
    }

    fn sample_power(&mut self) -> Option<Vec<DomainPower>> {
        self.energy.as_mut().map(|sampler| sampler.measure())
    }
}

/// Left fold of the terms. The first term's combinator has no effect.
pub fn evaluate_power(terms: &[PowerCondition], domains: &[DomainPower]) -> bool {
    terms
        .iter()
        .fold(None, |acc, term| {
            let watts = domain_watts(domains, &term.domain);
            let current = match term.comparison {
                Comparison::Greater => watts > term.threshold,
                Comparison::Less => watts < term.threshold,
            };
            Some(match (acc, term.combinator) {
                (None, _) => current,
                (Some(acc), Combinator::And) => acc && current,
                (Some(acc), Combinator::Or) => acc || current,
            })
        })
        .unwrap_or(false)
}

/// Outcome of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Hint files written successfully
    pub written: usize,
    /// Cores handled when the pass ended
    pub handled: usize,
}

/// Telemetry memoized for the duration of one pass
struct PassTelemetry<'a, T: ?Sized> {
    source: &'a mut T,
    load: Option<Option<LoadSample>>,
    power: Option<Option<Vec<DomainPower>>>,
}

impl<T: TelemetrySource + ?Sized> PassTelemetry<'_, T> {
    fn evaluate(&mut self, predicate: &Predicate) -> bool {
        match predicate {
            Predicate::Load { capture, threshold } => {
                let source = &mut *self.source;
                let sample = *self.load.get_or_insert_with(|| source.sample_load());
                sample.is_some_and(|s| {
                    let value = match capture {
                        LoadCapture::Single => s.single_core,
                        LoadCapture::Multi => s.multi_core,
                    };
                    value >= *threshold
                })
            }
            Predicate::Power(terms) => {
                let source = &mut *self.source;
                self.power
                    .get_or_insert_with(|| source.sample_power())
                    .as_deref()
                    .is_some_and(|domains| evaluate_power(terms, domains))
            }
        }
    }
}

/// Drives per-core hints from telemetry
#[derive(Debug)]
pub struct PolicyEngine<S, T> {
    store: S,
    telemetry: T,
}

impl<S: HintStore, T: TelemetrySource> PolicyEngine<S, T> {
    pub fn new(store: S, telemetry: T) -> Self {
        Self { store, telemetry }
    }

    pub fn core_count(&self) -> usize {
        self.store.core_count()
    }

    /// Run one pass over `rules`
    pub fn update(&mut self, rules: &[HintRule]) -> PassSummary {
        let cores = self.store.core_count();
        let mut handled = vec![false; cores];
        let mut current: Option<Vec<Option<String>>> = None;
        let mut telemetry = PassTelemetry {
            source: &mut self.telemetry,
            load: None,
            power: None,
        };
        let mut summary = PassSummary::default();

        for (index, rule) in rules.iter().enumerate() {
            if !rule.is_forced() && current.is_none() {
                current = Some(Self::read_current(&mut self.store, &mut handled));
            }

            let governed: Vec<usize> = (0..cores)
                .filter(|&core| {
                    !handled[core]
                        && (rule.is_forced()
                            || current
                                .as_ref()
                                .and_then(|hints| hints[core].as_deref())
                                .is_some_and(|hint| rule.owns(hint)))
                })
                .collect();

            if !governed.is_empty() {
                let predicate = telemetry.evaluate(&rule.predicate);
                let hint = rule.select(predicate);
                trace!(rule = index, predicate, "selected {} for {} cores", hint, governed.len());

                for core in governed {
                    let unchanged = current
                        .as_ref()
                        .and_then(|hints| hints[core].as_deref())
                        .is_some_and(|cur| cur == hint);
                    if rule.is_forced() || !unchanged {
                        match self.store.write_hint(core, hint) {
                            Ok(()) => {
                                debug!(cpu = core, "hint set to {}", hint);
                                summary.written += 1;
                            }
                            Err(e) => warn!(cpu = core, "Failed to set hint: {}", e),
                        }
                    }
                    handled[core] = true;
                }
            }

            if handled.iter().all(|&h| h) {
                break;
            }
        }

        summary.handled = handled.iter().filter(|&&h| h).count();
        summary
    }

    fn read_current(store: &mut S, handled: &mut [bool]) -> Vec<Option<String>> {
        (0..handled.len())
            .map(|core| match store.read_hint(core) {
                Ok(hint) => Some(hint),
                Err(e) => {
                    warn!(cpu = core, "Failed to get hint: {}", e);
                    handled[core] = true;
                    None
                }
            })
            .collect()
    }
}
