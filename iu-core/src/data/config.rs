//! Configuration snapshot
//!
//! An immutable description of everything one apply pass or one daemon
//! iteration should do. Built by the loader, dropped wholesale on reload.
//! The compact string forms accepted by the loader are parsed here through
//! `FromStr`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::DOMAIN_COUNT;
use crate::error::UndervoltError;

/// One voltage plane offset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndervoltTarget {
    pub plane: u8,
    pub title: String,
    /// Offset in millivolts; only the magnitude is used
    #[serde(rename = "mv")]
    pub millivolts: f64,
}

/// One power limit term (long or short)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerTerm {
    /// Watts; negative keeps the current register value
    pub power: f64,
    /// Seconds; zero or negative keeps the current register value
    #[serde(default = "PowerTerm::keep_window")]
    pub time_window: f64,
    #[serde(default = "PowerTerm::default_enabled")]
    pub enabled: bool,
}

impl PowerTerm {
    fn keep_window() -> f64 {
        -1.0
    }

    fn default_enabled() -> bool {
        true
    }
}

impl FromStr for PowerTerm {
    type Err = UndervoltError;

    /// `POWER[/SECONDS][:enabled|:disabled]...`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || UndervoltError::config(format!("Invalid power value: {}", s));

        let mut parts = s.split(':');
        let head = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;

        let (power, time_window) = match head.split_once('/') {
            Some((power, window)) => (power, parse_number(window).ok_or_else(invalid)?),
            None => (head, PowerTerm::keep_window()),
        };
        let power = power.parse::<i64>().map_err(|_| invalid())? as f64;

        let mut enabled = true;
        for flag in parts {
            enabled = match flag {
                "enabled" => true,
                "disabled" => false,
                _ => return Err(invalid()),
            };
        }

        Ok(Self {
            power,
            time_window,
            enabled,
        })
    }
}

/// Power limit request for one domain
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerLimitSpec {
    pub short_term: PowerTerm,
    pub long_term: PowerTerm,
}

/// Which load figure a rule compares against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadCapture {
    /// Busiest core
    Single,
    /// Sum over all cores
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Greater,
    Less,
}

/// One term of a power predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerCondition {
    pub combinator: Combinator,
    pub domain: String,
    pub comparison: Comparison,
    pub threshold: f64,
}

/// Condition selecting the load hint over the normal hint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    Load { capture: LoadCapture, threshold: f64 },
    Power(Vec<PowerCondition>),
}

impl FromStr for Predicate {
    type Err = UndervoltError;

    /// `load:single|multi:T` or `power:DOMAIN:gt|lt:W[:and|or:DOMAIN:gt|lt:W]...`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, args) = s.split_once(':').unwrap_or((s, ""));
        match algorithm {
            "load" => parse_load(args),
            "power" => parse_power(args),
            other => Err(UndervoltError::config(format!("Invalid algorithm: {}", other))),
        }
    }
}

fn parse_load(args: &str) -> Result<Predicate, UndervoltError> {
    let fields: Vec<&str> = args.split(':').collect();
    if fields.len() != 2 {
        return Err(UndervoltError::config(
            "Wrong number of arguments for 'load' algorithm",
        ));
    }
    let capture = match fields[0] {
        "single" => LoadCapture::Single,
        "multi" => LoadCapture::Multi,
        other => return Err(UndervoltError::config(format!("Invalid capture: {}", other))),
    };
    let threshold = parse_number(fields[1])
        .ok_or_else(|| UndervoltError::config(format!("Invalid threshold: {}", fields[1])))?;
    Ok(Predicate::Load { capture, threshold })
}

fn parse_power(args: &str) -> Result<Predicate, UndervoltError> {
    let fields: Vec<&str> = args.split(':').collect();
    // DOMAIN:CMP:W followed by any number of OP:DOMAIN:CMP:W groups
    if fields.len() < 3 || (fields.len() - 3) % 4 != 0 {
        return Err(UndervoltError::config(
            "Wrong number of arguments for 'power' algorithm",
        ));
    }

    let mut terms = Vec::new();
    let mut combinator = Combinator::Or;
    let mut rest = &fields[..];
    loop {
        let domain = rest[0];
        if domain.is_empty() {
            return Err(UndervoltError::config("Empty power domain"));
        }
        let comparison = match rest[1] {
            "gt" => Comparison::Greater,
            "lt" => Comparison::Less,
            other => return Err(UndervoltError::config(format!("Invalid operator: {}", other))),
        };
        let threshold = parse_number(rest[2])
            .ok_or_else(|| UndervoltError::config(format!("Invalid power: {}", rest[2])))?;
        terms.push(PowerCondition {
            combinator,
            domain: domain.to_string(),
            comparison,
            threshold,
        });

        rest = &rest[3..];
        if rest.is_empty() {
            break;
        }
        combinator = match rest[0] {
            "and" => Combinator::And,
            "or" => Combinator::Or,
            other => return Err(UndervoltError::config(format!("Invalid operator: {}", other))),
        };
        rest = &rest[1..];
    }

    Ok(Predicate::Power(terms))
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HintMode {
    /// Governs every core not yet handled
    #[serde(alias = "forced")]
    Force,
    /// Governs only cores currently set to one of its two hints
    Switch,
}

/// HWP energy performance preference rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HintRule {
    pub mode: HintMode,
    pub predicate: Predicate,
    pub load_hint: String,
    pub normal_hint: String,
}

impl HintRule {
    pub fn is_forced(&self) -> bool {
        self.mode == HintMode::Force
    }

    /// The hint to apply for a predicate outcome
    pub fn select(&self, predicate: bool) -> &str {
        if predicate {
            &self.load_hint
        } else {
            &self.normal_hint
        }
    }

    /// Whether a switch rule recognizes the core's current hint
    pub fn owns(&self, hint: &str) -> bool {
        hint == self.load_hint || hint == self.normal_hint
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Undervolt,
    Power,
    #[serde(rename = "tjoffset")]
    Thermal,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Undervolt => "undervolt",
            Self::Power => "power",
            Self::Thermal => "tjoffset",
        })
    }
}

/// Work item of one daemon iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonAction {
    pub kind: ActionKind,
    pub once: bool,
}

impl DaemonAction {
    /// Actions run when the configuration names none
    pub const DEFAULTS: [DaemonAction; 2] = [
        DaemonAction {
            kind: ActionKind::Power,
            once: false,
        },
        DaemonAction {
            kind: ActionKind::Thermal,
            once: false,
        },
    ];
}

impl FromStr for DaemonAction {
    type Err = UndervoltError;

    /// `undervolt|power|tjoffset[:once]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || UndervoltError::config(format!("Invalid daemon action: {}", s));
        let mut parts = s.split(':');
        let kind = match parts.next() {
            Some("undervolt") => ActionKind::Undervolt,
            Some("power") => ActionKind::Power,
            Some("tjoffset") => ActionKind::Thermal,
            _ => return Err(invalid()),
        };
        let mut once = false;
        for option in parts {
            match option {
                "once" => once = true,
                _ => return Err(invalid()),
            }
        }
        Ok(Self { kind, once })
    }
}

/// Complete configuration snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub undervolts: Vec<UndervoltTarget>,
    /// Indexed like [`crate::constants::POWER_DOMAINS`]; `None` = not participating
    pub power: [Option<PowerLimitSpec>; DOMAIN_COUNT],
    /// Degrees Celsius below TjMax
    pub tjoffset: Option<i32>,
    /// Daemon poll interval in milliseconds
    pub interval_ms: Option<i64>,
    pub hint_rules: Vec<HintRule>,
    pub daemon_actions: Vec<DaemonAction>,
}

impl Config {
    /// Whether any configured operation needs the MSR device
    pub fn needs_msr(&self) -> bool {
        let msr_power = self
            .power
            .iter()
            .zip(crate::constants::POWER_DOMAINS.iter())
            .any(|(spec, domain)| spec.is_some() && domain.msr_addr != 0);
        !self.undervolts.is_empty() || msr_power || self.tjoffset.is_some()
    }

    /// Daemon actions with defaults applied
    pub fn effective_daemon_actions(&self) -> &[DaemonAction] {
        if self.daemon_actions.is_empty() {
            &DaemonAction::DEFAULTS
        } else {
            &self.daemon_actions
        }
    }
}
