//! Per-chip thermal profiles and the continuous-vs-pulsed execution decision.
//!
//! The numbers in [`BUILTIN_PROFILES`] are empirical calibration data, not
//! physical constants. They can be replaced wholesale from a JSON file with
//! [`load_profiles`].

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PowerError, Result};

/// Heat-build and dissipation behaviour of one chip family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalProfile {
    /// Chip identifier, e.g. `"M1"` or `"M3 Max"`.
    pub chip: String,
    /// Time under sustained load before the chip reaches its thermal knee.
    pub heat_build_ms: u64,
    /// Time at idle to shed that heat.
    pub heat_dissipate_ms: u64,
    /// Percent of peak at which the cooling system starts to throttle.
    pub cooling_threshold_pct: f64,
}

impl ThermalProfile {
    fn new(chip: &str, heat_build_ms: u64, heat_dissipate_ms: u64, cooling_threshold_pct: f64) -> Self {
        Self {
            chip: chip.to_string(),
            heat_build_ms,
            heat_dissipate_ms,
            cooling_threshold_pct,
        }
    }

    /// Task duration at and above which pulsed execution is recommended.
    pub fn continuous_threshold_ms(&self) -> u64 {
        self.heat_dissipate_ms / 2
    }
}

/// Built-in profiles: `(chip, heat_build_ms, heat_dissipate_ms, cooling_threshold_pct)`.
pub const BUILTIN_PROFILES: &[(&str, u64, u64, f64)] = &[
    ("M1", 800, 1200, 85.0),
    ("M1 Pro", 750, 1150, 83.0),
    ("M1 Max", 700, 1300, 80.0),
    ("M2", 700, 1100, 80.0),
    ("M2 Pro", 650, 1050, 80.0),
    ("M2 Max", 600, 1200, 78.0),
    ("M3", 650, 1000, 80.0),
    ("M3 Pro", 600, 1000, 78.0),
    ("M3 Max", 550, 1100, 75.0),
    ("M4", 600, 900, 78.0),
    ("M4 Pro", 550, 950, 76.0),
    ("M4 Max", 500, 1000, 74.0),
];

/// The built-in table as owned profiles.
pub fn builtin_profiles() -> Vec<ThermalProfile> {
    BUILTIN_PROFILES
        .iter()
        .map(|&(chip, build, dissipate, threshold)| ThermalProfile::new(chip, build, dissipate, threshold))
        .collect()
}

/// A set of profiles plus the lookup and fallback rules.
#[derive(Debug, Clone)]
pub struct ProfileTable {
    profiles: Vec<ThermalProfile>,
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self::new(builtin_profiles())
    }
}

impl ProfileTable {
    pub fn new(profiles: Vec<ThermalProfile>) -> Self {
        Self { profiles }
    }

    pub fn profiles(&self) -> &[ThermalProfile] {
        &self.profiles
    }

    /// Exact (case-insensitive) match, else the longest profile name the
    /// identifier starts with, so `"Apple M2 Pro (12-core)"` finds `"M2 Pro"`.
    pub fn find(&self, chip: &str) -> Option<&ThermalProfile> {
        let wanted = normalize(chip);
        if let Some(p) = self.profiles.iter().find(|p| normalize(&p.chip) == wanted) {
            return Some(p);
        }
        let stripped = wanted.strip_prefix("apple ").unwrap_or(&wanted);
        self.profiles
            .iter()
            .filter(|p| {
                let name = normalize(&p.chip);
                stripped == name || stripped.starts_with(&format!("{name} "))
            })
            .max_by_key(|p| p.chip.len())
    }

    /// Profile for `chip`, or the conservative fallback when it is unknown.
    pub fn lookup(&self, chip: &str) -> ThermalProfile {
        match self.find(chip) {
            Some(p) => p.clone(),
            None => {
                log::warn!("unknown chip '{chip}', using the most conservative thermal profile");
                self.conservative(chip)
            }
        }
    }

    /// Slowest cooling and lowest threshold across the table, so unseen
    /// hardware is never under-protected.
    pub fn conservative(&self, chip: &str) -> ThermalProfile {
        let heat_build_ms = self.profiles.iter().map(|p| p.heat_build_ms).min().unwrap_or(500);
        let heat_dissipate_ms = self
            .profiles
            .iter()
            .map(|p| p.heat_dissipate_ms)
            .max()
            .unwrap_or(1300);
        let cooling_threshold_pct = self
            .profiles
            .iter()
            .map(|p| p.cooling_threshold_pct)
            .fold(f64::INFINITY, f64::min);
        ThermalProfile {
            chip: chip.to_string(),
            heat_build_ms,
            heat_dissipate_ms,
            cooling_threshold_pct: if cooling_threshold_pct.is_finite() {
                cooling_threshold_pct
            } else {
                74.0
            },
        }
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_lowercase()
}

/// Load a JSON array of profiles.
pub fn load_profiles(path: &Path) -> Result<ProfileTable> {
    let contents = std::fs::read_to_string(path)?;
    let profiles: Vec<ThermalProfile> = serde_json::from_str(&contents)
        .map_err(|e| PowerError::Config(format!("{}: {e}", path.display())))?;
    if profiles.is_empty() {
        return Err(PowerError::Config(format!("{}: no profiles", path.display())));
    }
    for p in &profiles {
        if p.heat_dissipate_ms == 0 {
            return Err(PowerError::Config(format!(
                "{}: profile '{}' has zero heat_dissipate_ms",
                path.display(),
                p.chip
            )));
        }
    }
    Ok(ProfileTable::new(profiles))
}

// ---------------------------------------------------------------------------
// Execution recommendation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum ExecutionPattern {
    Continuous,
    /// Run for `burst_ms`, idle for `cooldown_ms`, repeat.
    Pulsed { burst_ms: u64, cooldown_ms: u64 },
}

impl fmt::Display for ExecutionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continuous => write!(f, "continuous"),
            Self::Pulsed { burst_ms, cooldown_ms } => {
                write!(f, "pulsed ({burst_ms} ms on / {cooldown_ms} ms cooldown)")
            }
        }
    }
}

/// Continuous when the task is shorter than half the dissipation time,
/// otherwise bursts of that length separated by a full dissipation cooldown.
pub fn recommend_execution(task_ms: u64, profile: &ThermalProfile) -> ExecutionPattern {
    let threshold = profile.continuous_threshold_ms();
    if task_ms < threshold {
        ExecutionPattern::Continuous
    } else {
        ExecutionPattern::Pulsed {
            burst_ms: threshold.max(1),
            cooldown_ms: profile.heat_dissipate_ms,
        }
    }
}

/// Number of bursts a pulsed plan needs to cover `task_ms`.
pub fn burst_count(task_ms: u64, pattern: ExecutionPattern) -> u64 {
    match pattern {
        ExecutionPattern::Continuous => 1,
        ExecutionPattern::Pulsed { burst_ms, .. } => task_ms.div_ceil(burst_ms),
    }
}
