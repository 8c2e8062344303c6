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

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use iu_core::constants::{domain_index, voltage, DOMAIN_COUNT};
use iu_core::{
    Config, DaemonAction, HintMode, HintRule, PowerLimitSpec, PowerTerm, Predicate, UndervoltTarget,
};
use iu_error::{Result, UndervoltError};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/intel-undervolt.json";

/// Environment variable overriding the configuration path
pub const CONFIG_ENV: &str = "INTEL_UNDERVOLT_CONFIG";

/// A power term as written in the file: compact string or object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TermEntry {
    Compact(String),
    Full(PowerTerm),
}

impl TermEntry {
    fn resolve(self) -> Result<PowerTerm> {
        match self {
            Self::Compact(s) => s.parse(),
            Self::Full(term) => Ok(term),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PowerEntry {
    short_term: TermEntry,
    long_term: TermEntry,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HintEntry {
    mode: HintMode,
    algorithm: String,
    load_hint: String,
    normal_hint: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    undervolt: Vec<UndervoltTarget>,
    #[serde(default)]
    power: BTreeMap<String, PowerEntry>,
    #[serde(default)]
    tjoffset: Option<i32>,
    #[serde(default)]
    interval: Option<i64>,
    #[serde(default)]
    hwphint: Vec<HintEntry>,
    #[serde(default)]
    daemon: Vec<String>,
    #[serde(default)]
    enable: Option<serde_json::Value>,
    #[serde(default)]
    apply: Option<serde_json::Value>,
    #[serde(default)]
    tdp: Option<serde_json::Value>,
}

impl ConfigFile {
    /// Keys older configurations carry that no longer have any effect
    fn deprecated_keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        [("enable", &self.enable), ("apply", &self.apply), ("tdp", &self.tdp)]
            .into_iter()
            .filter(|(_, value)| value.is_some())
            .map(|(key, _)| key)
    }
}

/// Command line path, then `INTEL_UNDERVOLT_CONFIG`, then the system default
pub fn config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path).map_err(|source| UndervoltError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&data)?;
    debug!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Build a validated snapshot from JSON text
pub fn parse_config(data: &str) -> Result<Config> {
    let file: ConfigFile = serde_json::from_str(data)?;
    for key in file.deprecated_keys() {
        warn!("'{}' is deprecated and ignored", key);
    }

    let mut power: [Option<PowerLimitSpec>; DOMAIN_COUNT] = Default::default();
    for (name, entry) in file.power {
        let index = domain_index(&name)
            .ok_or_else(|| UndervoltError::config(format!("Invalid power domain: {}", name)))?;
        power[index] = Some(PowerLimitSpec {
            short_term: entry.short_term.resolve()?,
            long_term: entry.long_term.resolve()?,
        });
    }

    let hint_rules = file
        .hwphint
        .into_iter()
        .map(|entry| -> Result<HintRule> {
            Ok(HintRule {
                mode: entry.mode,
                predicate: entry.algorithm.parse::<Predicate>()?,
                load_hint: entry.load_hint,
                normal_hint: entry.normal_hint,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let daemon_actions = file
        .daemon
        .iter()
        .map(|s| s.parse::<DaemonAction>())
        .collect::<Result<Vec<_>>>()?;

    let config = Config {
        undervolts: file.undervolt,
        power,
        tjoffset: file.tjoffset,
        interval_ms: file.interval,
        hint_rules,
        daemon_actions,
    };
    validate_config(&config)?;
    Ok(config)
}

/// Cross-field rules serde cannot express
pub fn validate_config(config: &Config) -> Result<()> {
    for target in &config.undervolts {
        if !target.millivolts.is_finite() {
            return Err(UndervoltError::config(format!(
                "Invalid undervolt value for {} ({})",
                target.title, target.plane
            )));
        }
        if target.millivolts.abs() > voltage::MAX_MILLIVOLTS {
            return Err(UndervoltError::config(format!(
                "Undervolt value for {} ({}) exceeds {:.0} mV",
                target.title,
                target.plane,
                voltage::MAX_MILLIVOLTS
            )));
        }
    }

    validate_hint_rules(&config.hint_rules)
}

fn validate_hint_rules(rules: &[HintRule]) -> Result<()> {
    let mut seen = HashSet::new();
    for rule in rules {
        if !seen.insert(rule.load_hint.as_str()) || !seen.insert(rule.normal_hint.as_str()) {
            return Err(UndervoltError::config(
                "Same HWP hint can not be used multiple times",
            ));
        }
    }

    let forced = rules.iter().filter(|r| r.is_forced()).count();
    if forced > 1 {
        return Err(UndervoltError::config("Only single 'force' rule is allowed"));
    }
    if forced == 1 && rules.len() > 1 {
        return Err(UndervoltError::config(
            "'switch' rules are not allowed when 'force' rule is used",
        ));
    }
    Ok(())
}

/// Poll interval for daemon mode; must be positive
pub fn daemon_interval(config: &Config) -> Result<std::time::Duration> {
    match config.interval_ms {
        Some(ms) if ms > 0 => Ok(std::time::Duration::from_millis(ms as u64)),
        Some(ms) => Err(UndervoltError::config(format!("Invalid interval: {}", ms))),
        None => Err(UndervoltError::config("Interval is not set")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iu_core::{ActionKind, LoadCapture};
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL: &str = r#"{
        "undervolt": [
            {"plane": 0, "title": "CPU", "mv": -100},
            {"plane": 2, "title": "CPU Cache", "mv": -100}
        ],
        "power": {
            "package": {
                "short_term": "35/2.5",
                "long_term": {"power": 25, "time_window": 28, "enabled": true}
            }
        },
        "tjoffset": -20,
        "interval": 5000,
        "hwphint": [
            {"mode": "switch", "algorithm": "load:single:0.8",
             "load_hint": "performance", "normal_hint": "balance_power"}
        ],
        "daemon": ["undervolt:once", "power", "tjoffset"]
    }"#;

    #[test]
    fn test_parse_full_document() {
        let config = parse_config(FULL).unwrap();
        assert_eq!(config.undervolts.len(), 2);
        assert_eq!(config.undervolts[1].title, "CPU Cache");
        assert_eq!(config.undervolts[1].millivolts, -100.0);

        let package = config.power[0].unwrap();
        assert_eq!(package.short_term.power, 35.0);
        assert_eq!(package.short_term.time_window, 2.5);
        assert_eq!(package.long_term.time_window, 28.0);

        assert_eq!(config.tjoffset, Some(-20));
        assert_eq!(config.interval_ms, Some(5000));
        assert_eq!(
            config.hint_rules[0].predicate,
            Predicate::Load { capture: LoadCapture::Single, threshold: 0.8 }
        );
        assert_eq!(config.daemon_actions.len(), 3);
        assert_eq!(config.daemon_actions[0].kind, ActionKind::Undervolt);
        assert!(config.daemon_actions[0].once);
    }

    #[test]
    fn test_empty_document() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config, Config::default());
        assert!(daemon_interval(&config).is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(matches!(
            parse_config(r#"{"fans": []}"#),
            Err(UndervoltError::JsonParse(_))
        ));
    }

    #[test]
    fn test_unknown_power_domain() {
        let err = parse_config(r#"{"power": {"gpu": {"short_term": "10", "long_term": "10"}}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("gpu"));
    }

    #[test]
    fn test_malformed_values() {
        for doc in [
            r#"{"power": {"package": {"short_term": "ten", "long_term": "10"}}}"#,
            r#"{"hwphint": [{"mode": "switch", "algorithm": "load:single",
                "load_hint": "a", "normal_hint": "b"}]}"#,
            r#"{"hwphint": [{"mode": "sometimes", "algorithm": "load:single:1",
                "load_hint": "a", "normal_hint": "b"}]}"#,
            r#"{"daemon": ["fans"]}"#,
        ] {
            assert!(parse_config(doc).is_err(), "accepted {}", doc);
        }
    }

    #[test]
    fn test_hint_rule_invariants() {
        let dup = r#"{"hwphint": [
            {"mode": "switch", "algorithm": "load:single:0.8",
             "load_hint": "performance", "normal_hint": "power"},
            {"mode": "switch", "algorithm": "load:multi:2",
             "load_hint": "performance", "normal_hint": "default"}
        ]}"#;
        assert!(parse_config(dup).unwrap_err().to_string().contains("multiple times"));

        let same_pair = r#"{"hwphint": [
            {"mode": "switch", "algorithm": "load:single:0.8",
             "load_hint": "power", "normal_hint": "power"}
        ]}"#;
        assert!(parse_config(same_pair).is_err());

        let forced_mix = r#"{"hwphint": [
            {"mode": "force", "algorithm": "load:single:0.8",
             "load_hint": "performance", "normal_hint": "power"},
            {"mode": "switch", "algorithm": "load:multi:2", "load_hint": "a", "normal_hint": "b"}
        ]}"#;
        assert!(parse_config(forced_mix).unwrap_err().to_string().contains("'switch'"));

        let two_forced = r#"{"hwphint": [
            {"mode": "force", "algorithm": "load:single:0.8",
             "load_hint": "performance", "normal_hint": "power"},
            {"mode": "force", "algorithm": "load:multi:2", "load_hint": "a", "normal_hint": "b"}
        ]}"#;
        assert!(parse_config(two_forced).unwrap_err().to_string().contains("single 'force'"));
    }

    #[test]
    fn test_undervolt_range() {
        let doc = |mv: f64| {
            format!(r#"{{"undervolt": [{{"plane": 0, "title": "CPU", "mv": {}}}]}}"#, mv)
        };
        assert!(parse_config(&doc(-1999.0)).is_ok());
        assert!(parse_config(&doc(-1999.02)).is_ok());

        for mv in [-2000.0, -5000.0, 2100.0] {
            let err = parse_config(&doc(mv)).unwrap_err();
            assert!(matches!(err, UndervoltError::ConfigurationInvalid(_)), "{}", mv);
            assert!(err.to_string().contains("CPU (0)"));
        }
    }

    #[test]
    fn test_deprecated_keys_are_ignored() {
        let doc = r#"{
            "enable": true,
            "apply": ["undervolt", "power"],
            "tdp": {"short_term": 35, "long_term": 25},
            "tjoffset": -15
        }"#;
        let config = parse_config(doc).unwrap();
        assert_eq!(config.tjoffset, Some(-15));
        assert_eq!(config, Config { tjoffset: Some(-15), ..Config::default() });

        let file: ConfigFile = serde_json::from_str(doc).unwrap();
        assert_eq!(file.deprecated_keys().collect::<Vec<_>>(), ["enable", "apply", "tdp"]);
        let file: ConfigFile = serde_json::from_str("{}").unwrap();
        assert_eq!(file.deprecated_keys().count(), 0);
    }

    #[test]
    fn test_daemon_interval() {
        let mut config = Config::default();
        config.interval_ms = Some(250);
        assert_eq!(daemon_interval(&config).unwrap().as_millis(), 250);
        config.interval_ms = Some(0);
        assert!(matches!(
            daemon_interval(&config),
            Err(UndervoltError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(FULL.as_bytes()).unwrap();
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.tjoffset, Some(-20));

        let missing = load_config(Path::new("/nonexistent/intel-undervolt.json")).unwrap_err();
        assert!(matches!(missing, UndervoltError::FileRead { .. }));
    }

    #[test]
    #[serial]
    fn test_config_path_precedence() {
        env::remove_var(CONFIG_ENV);
        assert_eq!(config_path(None), PathBuf::from(DEFAULT_CONFIG_PATH));

        env::set_var(CONFIG_ENV, "/tmp/iu.json");
        assert_eq!(config_path(None), PathBuf::from("/tmp/iu.json"));
        assert_eq!(config_path(Some(Path::new("/opt/iu.json"))), PathBuf::from("/opt/iu.json"));
        env::remove_var(CONFIG_ENV);
    }
}
