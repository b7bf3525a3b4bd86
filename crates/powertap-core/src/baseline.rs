//! Is elevated idle power real work or waste?
//!
//! [`classify`] turns a measured baseline and a CPU-utilisation reading into
//! a [`BaselineState`] with legitimate/wasted power estimates.
//! [`wait_for_stable_baseline`] holds off a measurement until background
//! activity settles, up to a ceiling.
//!
//! All thresholds are [`BaselineConfig`] fields; the defaults are heuristics,
//! not derived constants.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median};

use crate::analysis::divergence_pct;
use crate::bus::Subscription;
use crate::sample::{Rail, SampleWindow};
use crate::shutdown::{HEARTBEAT, ShutdownState};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Rail whose idle level is judged.
    pub rail: Rail,
    /// Baselines above this are elevated.
    pub high_baseline_mw: f64,
    /// CPU utilisation above which elevated power leans legitimate.
    pub legitimate_util_pct: f64,
    /// CPU utilisation below which elevated power leans wasted.
    pub wasted_util_pct: f64,
    /// Power one percent of CPU utilisation is assumed to justify.
    pub mw_per_cpu_pct: f64,
    /// Extra power charged when a background task is confirmed on a P-core.
    pub pcore_tax_mw: f64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            rail: Rail::Package,
            high_baseline_mw: 1500.0,
            legitimate_util_pct: 20.0,
            wasted_util_pct: 10.0,
            mw_per_cpu_pct: 25.0,
            pcore_tax_mw: 400.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationConfig {
    /// Give up after this long. Timing out is an outcome, not an error.
    pub ceiling_secs: u64,
    /// Samples the stability test looks at.
    pub window_samples: usize,
    /// Max `(max - min) / median` across the window, in percent.
    pub max_spread_pct: f64,
    /// Max mean/median divergence across the window, in percent.
    pub max_divergence_pct: f64,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            ceiling_secs: 60,
            window_samples: 10,
            max_spread_pct: 10.0,
            max_divergence_pct: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BaselineState {
    Normal,
    /// Above threshold, no utilisation data to attribute it.
    Elevated,
    LikelyLegitimate,
    LikelyWasted,
    Mixed,
}

impl fmt::Display for BaselineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Elevated => "elevated",
            Self::LikelyLegitimate => "likely legitimate",
            Self::LikelyWasted => "likely wasted",
            Self::Mixed => "mixed",
        };
        f.write_str(s)
    }
}

/// Where a known high-power background task was observed running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorePlacement {
    #[default]
    Unknown,
    Efficiency,
    Performance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineAssessment {
    pub state: BaselineState,
    pub baseline_mw: f64,
    pub threshold_mw: f64,
    pub cpu_util_pct: Option<f64>,
    /// Baseline above threshold (0 when normal).
    pub excess_mw: f64,
    /// Excess explained by measured CPU utilisation.
    pub legitimate_mw: f64,
    pub wasted_mw: f64,
    pub placement: CorePlacement,
}

/// Classify one baseline measurement.
pub fn classify(
    baseline_mw: f64,
    cpu_util_pct: Option<f64>,
    placement: CorePlacement,
    config: &BaselineConfig,
) -> BaselineAssessment {
    let threshold_mw = config.high_baseline_mw;
    let mut out = BaselineAssessment {
        state: BaselineState::Normal,
        baseline_mw,
        threshold_mw,
        cpu_util_pct,
        excess_mw: 0.0,
        legitimate_mw: 0.0,
        wasted_mw: 0.0,
        placement,
    };
    if baseline_mw <= threshold_mw {
        return out;
    }

    let excess = baseline_mw - threshold_mw;
    out.excess_mw = excess;
    out.state = match cpu_util_pct {
        None => BaselineState::Elevated,
        Some(u) if u > config.legitimate_util_pct => BaselineState::LikelyLegitimate,
        Some(u) if u < config.wasted_util_pct => BaselineState::LikelyWasted,
        Some(_) => BaselineState::Mixed,
    };
    if let Some(u) = cpu_util_pct {
        out.legitimate_mw = (u.max(0.0) * config.mw_per_cpu_pct).min(excess);
        out.wasted_mw = excess - out.legitimate_mw;
    }

    // P-core confirmation only ever adds to the wasted estimate.
    if placement == CorePlacement::Performance {
        let ceiling = baseline_mw - out.legitimate_mw;
        out.wasted_mw = (out.wasted_mw + config.pcore_tax_mw).min(ceiling);
        if matches!(out.state, BaselineState::Mixed | BaselineState::Elevated) {
            out.state = BaselineState::LikelyWasted;
        }
    }
    out
}

/// Median of one rail, the robust baseline estimate.
pub fn baseline_of(window: &SampleWindow, rail: Rail) -> Option<f64> {
    let values = window.values(rail);
    if values.is_empty() {
        return None;
    }
    Some(Data::new(values).median())
}

// ---------------------------------------------------------------------------
// CPU utilisation
// ---------------------------------------------------------------------------

/// Source of a system-wide CPU utilisation percentage.
pub trait CpuUtilization {
    fn sample_pct(&mut self) -> Option<f64>;
}

/// Reads utilisation through `sysinfo`.
pub struct SysinfoCpu {
    system: sysinfo::System,
}

impl Default for SysinfoCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoCpu {
    pub fn new() -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl CpuUtilization for SysinfoCpu {
    /// Blocks for `sysinfo::MINIMUM_CPU_UPDATE_INTERVAL` between refreshes.
    fn sample_pct(&mut self) -> Option<f64> {
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        self.system.refresh_cpu_usage();
        let pct = f64::from(self.system.global_cpu_usage());
        pct.is_finite().then_some(pct)
    }
}

/// Fixed reading, for tests and replays.
#[derive(Debug, Clone, Copy)]
pub struct FixedCpu(pub Option<f64>);

impl CpuUtilization for FixedCpu {
    fn sample_pct(&mut self) -> Option<f64> {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Stabilisation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StabilizationOutcome {
    Stable { waited: Duration, baseline_mw: f64 },
    /// The ceiling passed first. `last_mw` is the median of what was seen.
    TimedOut { waited: Duration, last_mw: Option<f64> },
    Interrupted,
}

/// Whether `window` looks settled enough to take a baseline from.
pub fn is_stable(window: &SampleWindow, rail: Rail, config: &StabilizationConfig) -> bool {
    if !window.is_full() {
        return false;
    }
    let values = window.values(rail);
    if values.len() < window.capacity() {
        return false;
    }
    let Some(median) = baseline_of(window, rail) else {
        return false;
    };
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let spread_pct = if median.abs() > 1e-9 {
        (max - min) / median.abs() * 100.0
    } else if max - min == 0.0 {
        0.0
    } else {
        f64::INFINITY
    };
    spread_pct <= config.max_spread_pct && divergence_pct(mean, median) <= config.max_divergence_pct
}

/// Consume samples until the rail settles, the ceiling passes, or shutdown
/// is requested. Never waits longer than [`HEARTBEAT`] between checks.
pub fn wait_for_stable_baseline(
    subscription: &Subscription,
    rail: Rail,
    config: &StabilizationConfig,
    shutdown: &ShutdownState,
) -> StabilizationOutcome {
    let start = Instant::now();
    let ceiling = Duration::from_secs(config.ceiling_secs);
    let mut window = SampleWindow::new(config.window_samples.max(2));

    loop {
        if shutdown.is_requested() {
            return StabilizationOutcome::Interrupted;
        }
        let waited = start.elapsed();
        if waited >= ceiling {
            log::warn!("baseline did not stabilise within {ceiling:?}");
            return StabilizationOutcome::TimedOut {
                waited,
                last_mw: baseline_of(&window, rail),
            };
        }

        let wait = HEARTBEAT.min(ceiling - waited);
        window.extend(subscription.recv_timeout(wait));
        if is_stable(&window, rail, config)
            && let Some(baseline_mw) = baseline_of(&window, rail)
        {
            let waited = start.elapsed();
            log::info!("baseline stable at {baseline_mw:.1} mW after {waited:?}");
            return StabilizationOutcome::Stable { waited, baseline_mw };
        }
        if subscription.is_finished() {
            return StabilizationOutcome::TimedOut {
                waited: start.elapsed(),
                last_mw: baseline_of(&window, rail),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SampleBus;
    use crate::sample::PowerSample;
    use crate::shutdown::ShutdownCause;

    fn cfg() -> BaselineConfig {
        BaselineConfig::default()
    }

    // -----------------------------------------------------------------------
    // classify
    // -----------------------------------------------------------------------

    #[test]
    fn below_threshold_is_normal() {
        let a = classify(1200.0, Some(50.0), CorePlacement::Unknown, &cfg());
        assert_eq!(a.state, BaselineState::Normal);
        assert_eq!(a.excess_mw, 0.0);
    }

    #[test]
    fn no_utilisation_is_just_elevated() {
        let a = classify(2000.0, None, CorePlacement::Unknown, &cfg());
        assert_eq!(a.state, BaselineState::Elevated);
        assert_eq!(a.excess_mw, 500.0);
    }

    #[test]
    fn utilisation_thresholds() {
        let c = cfg();
        assert_eq!(
            classify(2000.0, Some(35.0), CorePlacement::Unknown, &c).state,
            BaselineState::LikelyLegitimate
        );
        assert_eq!(
            classify(2000.0, Some(5.0), CorePlacement::Unknown, &c).state,
            BaselineState::LikelyWasted
        );
        assert_eq!(
            classify(2000.0, Some(15.0), CorePlacement::Unknown, &c).state,
            BaselineState::Mixed
        );
        // Boundaries are exclusive.
        assert_eq!(
            classify(2000.0, Some(20.0), CorePlacement::Unknown, &c).state,
            BaselineState::Mixed
        );
        assert_eq!(
            classify(2000.0, Some(10.0), CorePlacement::Unknown, &c).state,
            BaselineState::Mixed
        );
    }

    #[test]
    fn legitimate_floor_from_utilisation() {
        // 15% * 25 mW = 375 mW of the 500 mW excess is explained.
        let a = classify(2000.0, Some(15.0), CorePlacement::Unknown, &cfg());
        assert_eq!(a.legitimate_mw, 375.0);
        assert_eq!(a.wasted_mw, 125.0);
    }

    #[test]
    fn pcore_only_increases_waste() {
        let c = cfg();
        let before = classify(2000.0, Some(15.0), CorePlacement::Unknown, &c);
        let after = classify(2000.0, Some(15.0), CorePlacement::Performance, &c);
        assert!(after.wasted_mw > before.wasted_mw);
        assert_eq!(after.legitimate_mw, before.legitimate_mw);
        assert_eq!(after.state, BaselineState::LikelyWasted);

        let legit = classify(3000.0, Some(60.0), CorePlacement::Performance, &c);
        assert_eq!(legit.state, BaselineState::LikelyLegitimate);
        assert_eq!(legit.legitimate_mw, 1500.0);
    }

    #[test]
    fn efficiency_placement_changes_nothing() {
        let c = cfg();
        let a = classify(2000.0, Some(15.0), CorePlacement::Unknown, &c);
        let b = classify(2000.0, Some(15.0), CorePlacement::Efficiency, &c);
        assert_eq!(a.state, b.state);
        assert_eq!(a.wasted_mw, b.wasted_mw);
    }

    // -----------------------------------------------------------------------
    // Stabilisation
    // -----------------------------------------------------------------------

    fn fill(w: &mut SampleWindow, values: &[f64]) {
        for (i, &v) in values.iter().enumerate() {
            w.push(PowerSample::at(i as f64).with(Rail::Package, v));
        }
    }

    #[test]
    fn flat_window_is_stable() {
        let mut w = SampleWindow::new(5);
        fill(&mut w, &[1000.0, 1010.0, 995.0, 1005.0, 1000.0]);
        assert!(is_stable(&w, Rail::Package, &StabilizationConfig::default()));
    }

    #[test]
    fn spiky_or_partial_window_is_not_stable() {
        let c = StabilizationConfig::default();
        let mut w = SampleWindow::new(5);
        fill(&mut w, &[1000.0, 1000.0, 3000.0, 1000.0, 1000.0]);
        assert!(!is_stable(&w, Rail::Package, &c));

        let mut partial = SampleWindow::new(5);
        fill(&mut partial, &[1000.0, 1000.0]);
        assert!(!is_stable(&partial, Rail::Package, &c));
    }

    #[test]
    fn waits_until_stable() {
        let bus = SampleBus::new();
        let sub = bus.subscribe();
        for i in 0..10 {
            bus.publish(PowerSample::at(i as f64).with(Rail::Package, 900.0));
        }
        let outcome = wait_for_stable_baseline(
            &sub,
            Rail::Package,
            &StabilizationConfig::default(),
            &ShutdownState::new(),
        );
        match outcome {
            StabilizationOutcome::Stable { baseline_mw, .. } => assert_eq!(baseline_mw, 900.0),
            other => panic!("expected stable, got {other:?}"),
        }
    }

    #[test]
    fn ceiling_is_a_valid_outcome() {
        let bus = SampleBus::new();
        let sub = bus.subscribe();
        let config = StabilizationConfig {
            ceiling_secs: 0,
            ..Default::default()
        };
        let outcome = wait_for_stable_baseline(&sub, Rail::Package, &config, &ShutdownState::new());
        assert!(matches!(outcome, StabilizationOutcome::TimedOut { last_mw: None, .. }));
    }

    #[test]
    fn shutdown_interrupts_wait() {
        let bus = SampleBus::new();
        let sub = bus.subscribe();
        let shutdown = ShutdownState::new();
        shutdown.request(ShutdownCause::Requested);
        let outcome = wait_for_stable_baseline(
            &sub,
            Rail::Package,
            &StabilizationConfig::default(),
            &shutdown,
        );
        assert_eq!(outcome, StabilizationOutcome::Interrupted);
    }

    #[test]
    fn fixed_cpu_reports_its_value() {
        assert_eq!(FixedCpu(Some(12.5)).sample_pct(), Some(12.5));
    }
}
