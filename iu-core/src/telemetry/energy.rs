//! Average power from RAPL energy counters
//!
//! Each powercap zone exposes a cumulative `energy_uj` counter. Power is the
//! counter delta over the monotonic time between two reads.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, trace};

use crate::constants::paths;
use crate::error::{Result, UndervoltError};

/// Power of one energy domain
#[derive(Debug, Clone, PartialEq)]
pub struct DomainPower {
    pub name: String,
    /// `None` until two increasing readings exist
    pub watts: Option<f64>,
}

impl DomainPower {
    /// Exact name, or the name followed by `-` (`package` matches `package-0`)
    pub fn matches(&self, domain: &str) -> bool {
        match self.name.strip_prefix(domain) {
            Some(rest) => rest.is_empty() || rest.starts_with('-'),
            None => false,
        }
    }
}

#[derive(Debug)]
struct EnergyZone {
    name: String,
    dir: PathBuf,
    last: Option<(u64, Instant)>,
    watts: Option<f64>,
}

/// Stateful powercap reader
#[derive(Debug)]
pub struct EnergySampler {
    zones: Vec<EnergyZone>,
}

impl EnergySampler {
    pub fn new() -> Result<Self> {
        Self::with_root(Path::new(paths::POWERCAP_DIR))
    }

    /// Enumerate zones under `root`: entries containing `:` with a non-empty `name`
    pub fn with_root(root: &Path) -> Result<Self> {
        let entries = fs::read_dir(root).map_err(|source| UndervoltError::FileRead {
            path: root.to_path_buf(),
            source,
        })?;

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(':'))
            .map(|e| e.path())
            .collect();
        dirs.sort();

        let zones: Vec<EnergyZone> = dirs
            .into_iter()
            .filter_map(|dir| {
                let name = fs::read_to_string(dir.join("name")).ok()?;
                let name = name.trim_end_matches('\n').to_string();
                if name.is_empty() {
                    return None;
                }
                Some(EnergyZone {
                    name,
                    dir,
                    last: None,
                    watts: None,
                })
            })
            .collect();

        debug!("Discovered {} energy domains under {}", zones.len(), root.display());
        Ok(Self { zones })
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Read every counter once and return the updated powers
    pub fn measure(&mut self) -> Vec<DomainPower> {
        for index in 0..self.zones.len() {
            let path = self.zones[index].dir.join("energy_uj");
            match fs::read_to_string(&path) {
                Ok(content) => match content.trim().parse::<u64>() {
                    Ok(energy) => self.update(index, energy, Instant::now()),
                    Err(e) => trace!("Unparsable {}: {}", path.display(), e),
                },
                Err(e) => trace!("Failed to read {}: {}", path.display(), e),
            }
        }
        self.domains()
    }

    /// Feed one counter reading for zone `index`
    pub fn update(&mut self, index: usize, energy_uj: u64, at: Instant) {
        let Some(zone) = self.zones.get_mut(index) else {
            return;
        };
        if let Some((last, then)) = zone.last {
            let elapsed = at.saturating_duration_since(then).as_nanos();
            if energy_uj > last && elapsed > 0 {
                zone.watts = Some((energy_uj - last) as f64 * 1000.0 / elapsed as f64);
            }
        }
        zone.last = Some((energy_uj, at));
    }

    /// Current view without reading the counters
    pub fn domains(&self) -> Vec<DomainPower> {
        self.zones
            .iter()
            .map(|z| DomainPower {
                name: z.name.clone(),
                watts: z.watts,
            })
            .collect()
    }
}
