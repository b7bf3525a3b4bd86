//! Distribution shape of recent power samples.
//!
//! The question this module answers is "is something bursting (or dropping
//! out) underneath a baseline that should be flat?". Two numbers answer two
//! different halves of it:
//!
//! - **Divergence**: `|mean - median| / median`, in percent. A flat signal
//!   has mean == median; a few high-power bursts pull the mean above the
//!   median (right skew), brief drop-outs pull it below (left skew).
//!   This is the statistical-significance half.
//! - **Fraction**: given a low anchor `L` and a high anchor `H`, the share
//!   of time `f` spent at `L` solves `mean = L*f + H*(1-f)`, i.e.
//!   `f = (H - mean) / (H - L)`. This is the physical time-share half. In
//!   this system's calibration a 1% divergence corresponds to roughly a
//!   2-3% time share, so both are always reported.
//!
//! The fraction solver is one function, [`solve_burst_fraction`], used for
//! every rail. Rails only differ in which values are fed to it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median, Statistics};

use crate::sample::{PowerSample, Rail, SampleWindow};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Low (idle) and high (peak) power anchors for one rail, in mW.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchors {
    pub low_mw: f64,
    pub high_mw: f64,
}

impl Anchors {
    pub fn new(low_mw: f64, high_mw: f64) -> Self {
        Self { low_mw, high_mw }
    }
}

/// Analyzer tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Samples kept per analysis window.
    pub window_capacity: usize,
    /// Divergence (percent) at or above which the distribution is skewed.
    pub symmetric_threshold_pct: f64,
    /// Per-rail anchors for the fraction solver.
    pub anchors: BTreeMap<Rail, Anchors>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window_capacity: 200,
            symmetric_threshold_pct: 1.0,
            anchors: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkewDirection {
    /// Mean above median: occasional high-power bursts.
    RightSkewed,
    /// Mean below median: occasional drop-outs.
    LeftSkewed,
    Symmetric,
}

impl fmt::Display for SkewDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RightSkewed => write!(f, "right-skewed"),
            Self::LeftSkewed => write!(f, "left-skewed"),
            Self::Symmetric => write!(f, "symmetric"),
        }
    }
}

/// The fraction solver could not produce a physically meaningful answer.
/// Recoverable: callers log it and keep going.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnchorMismatch {
    /// `L == H`: the formula would divide by zero.
    Degenerate { anchor_mw: f64 },
    /// Mean or anchors are NaN/infinite.
    NonFinite,
    /// The solved fraction fell outside `[0, 1]` and was clamped.
    OutOfRange { raw_fraction: f64 },
}

impl fmt::Display for AnchorMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Degenerate { anchor_mw } => {
                write!(f, "low and high anchors are both {anchor_mw:.1} mW")
            }
            Self::NonFinite => write!(f, "mean or anchors are not finite"),
            Self::OutOfRange { raw_fraction } => write!(
                f,
                "solved fraction {raw_fraction:.3} is outside [0, 1]; anchors do not bracket the mean"
            ),
        }
    }
}

impl std::error::Error for AnchorMismatch {}

/// A solved fraction, always within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FractionEstimate {
    /// Share of time at the low anchor (drop/idle share).
    pub fraction: f64,
    /// The unclamped solution.
    pub raw_fraction: f64,
    /// Set when `raw_fraction` had to be clamped.
    pub warning: Option<AnchorMismatch>,
}

impl FractionEstimate {
    /// Share of time at the high anchor.
    pub fn burst_fraction(&self) -> f64 {
        1.0 - self.fraction
    }
}

/// Shape of one rail's distribution over one window snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivergenceReport {
    pub samples: usize,
    pub mean_mw: f64,
    pub median_mw: f64,
    /// `|mean - median| / median`, expressed in percent.
    pub divergence_pct: f64,
    pub skew_direction: SkewDirection,
    /// Third standardized moment, 0 for symmetric or constant data.
    pub skewness: f64,
    /// `divergence_pct` reached the configured threshold.
    pub significant: bool,
    /// Time share at the low anchor, when anchors were supplied and usable.
    pub drop_or_burst_fraction: Option<f64>,
    /// Why the fraction is missing or was clamped.
    pub anchor_warning: Option<AnchorMismatch>,
}

/// Share of a total attributable to one component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    pub rail: Rail,
    /// `component / total` at load.
    pub absolute_share: Option<f64>,
    /// `delta_component / delta_total` between baseline and load.
    pub delta_share: Option<f64>,
}

// ---------------------------------------------------------------------------
// Core formulas
// ---------------------------------------------------------------------------

const EPS: f64 = 1e-9;

/// Solve `mean = L*f + H*(1-f)` for `f`, clamped to `[0, 1]`.
///
/// This is the only implementation of the formula; every rail goes through
/// it with no special-casing.
pub fn solve_burst_fraction(mean_mw: f64, anchors: Anchors) -> Result<FractionEstimate, AnchorMismatch> {
    let Anchors { low_mw, high_mw } = anchors;
    if !(mean_mw.is_finite() && low_mw.is_finite() && high_mw.is_finite()) {
        return Err(AnchorMismatch::NonFinite);
    }
    let span = high_mw - low_mw;
    if span.abs() < EPS {
        return Err(AnchorMismatch::Degenerate { anchor_mw: low_mw });
    }

    let raw = (high_mw - mean_mw) / span;
    let fraction = raw.clamp(0.0, 1.0);
    let warning = if (fraction - raw).abs() > EPS {
        Some(AnchorMismatch::OutOfRange { raw_fraction: raw })
    } else {
        None
    };
    Ok(FractionEstimate {
        fraction,
        raw_fraction: raw,
        warning,
    })
}

/// Mean of `values` fed through [`solve_burst_fraction`].
pub fn fraction_from_values(values: &[f64], anchors: Anchors) -> Option<Result<FractionEstimate, AnchorMismatch>> {
    if values.is_empty() {
        return None;
    }
    Some(solve_burst_fraction(values.iter().mean(), anchors))
}

/// Fraction for one rail of a window.
pub fn rail_burst_fraction(
    window: &SampleWindow,
    rail: Rail,
    anchors: Anchors,
) -> Option<Result<FractionEstimate, AnchorMismatch>> {
    fraction_from_values(&window.values(rail), anchors)
}

/// Sample skewness (third standardized moment).
pub fn skewness(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if std_dev < 1e-10 {
        return 0.0;
    }
    values
        .iter()
        .map(|&x| ((x - mean) / std_dev).powi(3))
        .sum::<f64>()
        / n
}

/// Divergence percentage between a mean and a median.
///
/// Normalised by the median. A zero median falls back to normalising by the
/// mean, so the result stays finite and is still 0 exactly when mean equals
/// median.
pub fn divergence_pct(mean_mw: f64, median_mw: f64) -> f64 {
    let gap = (mean_mw - median_mw).abs();
    if gap == 0.0 {
        return 0.0;
    }
    let scale = if median_mw.abs() > EPS {
        median_mw.abs()
    } else {
        mean_mw.abs()
    };
    gap / scale * 100.0
}

/// Divergence report for raw values. `None` for an empty slice.
pub fn divergence(
    values: &[f64],
    threshold_pct: f64,
    anchors: Option<Anchors>,
) -> Option<DivergenceReport> {
    if values.is_empty() {
        return None;
    }
    let mean_mw = values.iter().mean();
    let median_mw = Data::new(values.to_vec()).median();
    let pct = divergence_pct(mean_mw, median_mw);
    let significant = pct > 0.0 && pct >= threshold_pct;

    let skew_direction = if !significant {
        SkewDirection::Symmetric
    } else if mean_mw > median_mw {
        SkewDirection::RightSkewed
    } else {
        SkewDirection::LeftSkewed
    };

    let (drop_or_burst_fraction, anchor_warning) = match anchors.map(|a| solve_burst_fraction(mean_mw, a)) {
        Some(Ok(est)) => (Some(est.fraction), est.warning),
        Some(Err(mismatch)) => (None, Some(mismatch)),
        None => (None, None),
    };

    Some(DivergenceReport {
        samples: values.len(),
        mean_mw,
        median_mw,
        divergence_pct: pct,
        skew_direction,
        skewness: skewness(values),
        significant,
        drop_or_burst_fraction,
        anchor_warning,
    })
}

/// Divergence report for one rail of a window.
pub fn window_divergence(
    window: &SampleWindow,
    rail: Rail,
    config: &AnalyzerConfig,
) -> Option<DivergenceReport> {
    divergence(
        &window.values(rail),
        config.symmetric_threshold_pct,
        config.anchors.get(&rail).copied(),
    )
}

/// `component / total`, `None` when the total is effectively zero.
pub fn absolute_share(component_mw: f64, total_mw: f64) -> Option<f64> {
    if total_mw.abs() < EPS {
        None
    } else {
        Some(component_mw / total_mw)
    }
}

/// `(component_load - component_base) / (total_load - total_base)`.
pub fn delta_share(component_base: f64, component_load: f64, total_base: f64, total_load: f64) -> Option<f64> {
    absolute_share(component_load - component_base, total_load - total_base)
}

fn rail_mean(window: &SampleWindow, rail: Rail) -> Option<f64> {
    let values = window.values(rail);
    if values.is_empty() {
        None
    } else {
        Some(values.iter().mean())
    }
}

/// Attribute package power to `rail`, both at load and as a delta from a
/// baseline window. The two can disagree sharply, which is why both are
/// returned.
pub fn attribution(rail: Rail, baseline: &SampleWindow, load: &SampleWindow) -> Attribution {
    let comp_load = rail_mean(load, rail);
    let total_load = rail_mean(load, Rail::Package);
    let absolute_share = match (comp_load, total_load) {
        (Some(c), Some(t)) => absolute_share(c, t),
        _ => None,
    };
    let delta_share = match (
        rail_mean(baseline, rail),
        comp_load,
        rail_mean(baseline, Rail::Package),
        total_load,
    ) {
        (Some(cb), Some(cl), Some(tb), Some(tl)) => delta_share(cb, cl, tb, tl),
        _ => None,
    };
    Attribution {
        rail,
        absolute_share,
        delta_share,
    }
}

// ---------------------------------------------------------------------------
// Streaming analyzer
// ---------------------------------------------------------------------------

/// Per-rail reports for one analysis tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    pub window_len: usize,
    pub reports: BTreeMap<Rail, DivergenceReport>,
}

/// Keeps its own window of recent samples and reports on demand.
#[derive(Debug, Clone)]
pub struct Analyzer {
    config: AnalyzerConfig,
    window: SampleWindow,
    baseline: Option<SampleWindow>,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        let window = SampleWindow::new(config.window_capacity);
        Self {
            config,
            window,
            baseline: None,
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn ingest<I: IntoIterator<Item = PowerSample>>(&mut self, samples: I) {
        self.window.extend(samples);
    }

    pub fn window(&self) -> &SampleWindow {
        &self.window
    }

    /// Freeze the current window as the idle baseline for delta attribution.
    pub fn mark_baseline(&mut self) {
        self.baseline = Some(self.window.clone());
        self.window.clear();
    }

    pub fn report(&self, rail: Rail) -> Option<DivergenceReport> {
        let report = window_divergence(&self.window, rail, &self.config)?;
        if let Some(w) = report.anchor_warning {
            log::warn!("{rail}: anchor mismatch: {w}");
        }
        Some(report)
    }

    pub fn snapshot(&self) -> AnalysisSnapshot {
        let reports = Rail::ALL
            .iter()
            .filter_map(|&rail| self.report(rail).map(|r| (rail, r)))
            .collect();
        AnalysisSnapshot {
            window_len: self.window.len(),
            reports,
        }
    }

    /// Attribution of each component rail against the marked baseline.
    pub fn attributions(&self) -> Vec<Attribution> {
        let empty = SampleWindow::new(1);
        let baseline = self.baseline.as_ref().unwrap_or(&empty);
        Rail::COMPONENTS
            .iter()
            .map(|&rail| attribution(rail, baseline, &self.window))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    // -----------------------------------------------------------------------
    // Divergence
    // -----------------------------------------------------------------------

    #[test]
    fn constant_values_are_symmetric() {
        let r = divergence(&[1200.0; 20], 1.0, None).unwrap();
        assert_eq!(r.divergence_pct, 0.0);
        assert_eq!(r.skew_direction, SkewDirection::Symmetric);
        assert!(!r.significant);
        assert_eq!(r.skewness, 0.0);
    }

    #[test]
    fn bursts_skew_right() {
        let mut v = vec![1000.0; 18];
        v.extend([3000.0, 3000.0]);
        let r = divergence(&v, 1.0, None).unwrap();
        assert_eq!(r.median_mw, 1000.0);
        assert!(approx(r.mean_mw, 1200.0));
        assert!(approx(r.divergence_pct, 20.0));
        assert_eq!(r.skew_direction, SkewDirection::RightSkewed);
        assert!(r.skewness > 0.0);
    }

    #[test]
    fn dropouts_skew_left() {
        let mut v = vec![1000.0; 18];
        v.extend([0.0, 0.0]);
        let r = divergence(&v, 1.0, None).unwrap();
        assert_eq!(r.skew_direction, SkewDirection::LeftSkewed);
    }

    #[test]
    fn below_threshold_is_symmetric() {
        let mut v = vec![1000.0; 99];
        v.push(1500.0);
        let r = divergence(&v, 1.0, None).unwrap();
        assert!(r.divergence_pct > 0.0 && r.divergence_pct < 1.0);
        assert_eq!(r.skew_direction, SkewDirection::Symmetric);
    }

    #[test]
    fn divergence_symmetric_under_relabeling() {
        let a = divergence(&[100.0, 250.0], 1.0, None).unwrap();
        let b = divergence(&[250.0, 100.0], 1.0, None).unwrap();
        assert_eq!(a.divergence_pct, b.divergence_pct);
    }

    #[test]
    fn zero_median_stays_finite() {
        let pct = divergence_pct(5.0, 0.0);
        assert!(pct.is_finite());
        assert_eq!(divergence_pct(0.0, 0.0), 0.0);
    }

    #[test]
    fn empty_values_yield_none() {
        assert!(divergence(&[], 1.0, None).is_none());
    }

    // -----------------------------------------------------------------------
    // Fraction solver
    // -----------------------------------------------------------------------

    #[test]
    fn half_and_half() {
        let est = solve_burst_fraction(1650.0, Anchors::new(800.0, 2500.0)).unwrap();
        assert!(approx(est.fraction, 0.5));
        assert!(approx(est.burst_fraction(), 0.5));
        assert!(est.warning.is_none());
    }

    #[test]
    fn identical_anchors_flag_instead_of_dividing() {
        let err = solve_burst_fraction(1000.0, Anchors::new(900.0, 900.0)).unwrap_err();
        assert!(matches!(err, AnchorMismatch::Degenerate { .. }));
    }

    #[test]
    fn out_of_range_is_clamped_and_flagged() {
        let est = solve_burst_fraction(3000.0, Anchors::new(800.0, 2500.0)).unwrap();
        assert_eq!(est.fraction, 0.0);
        assert!(est.raw_fraction < 0.0);
        assert!(matches!(est.warning, Some(AnchorMismatch::OutOfRange { .. })));

        let est = solve_burst_fraction(100.0, Anchors::new(800.0, 2500.0)).unwrap();
        assert_eq!(est.fraction, 1.0);
        assert!(est.warning.is_some());
    }

    #[test]
    fn nan_mean_is_non_finite() {
        assert_eq!(
            solve_burst_fraction(f64::NAN, Anchors::new(1.0, 2.0)),
            Err(AnchorMismatch::NonFinite)
        );
    }

    #[test]
    fn same_numbers_same_answer_for_every_rail() {
        let anchors = Anchors::new(800.0, 2500.0);
        let values = [800.0, 800.0, 2500.0, 1200.0];
        let direct = fraction_from_values(&values, anchors).unwrap().unwrap();

        for rail in Rail::COMPONENTS {
            let mut w = SampleWindow::new(10);
            for (i, &v) in values.iter().enumerate() {
                w.push(PowerSample::at(i as f64).with(rail, v));
            }
            let via_rail = rail_burst_fraction(&w, rail, anchors).unwrap().unwrap();
            assert_eq!(via_rail, direct, "rail {rail} diverged from the shared solver");
        }
    }

    #[test]
    fn report_carries_fraction_and_warning() {
        let r = divergence(&[800.0, 2500.0], 1.0, Some(Anchors::new(800.0, 2500.0))).unwrap();
        assert!(approx(r.drop_or_burst_fraction.unwrap(), 0.5));
        let r = divergence(&[800.0, 2500.0], 1.0, Some(Anchors::new(5.0, 5.0))).unwrap();
        assert!(r.drop_or_burst_fraction.is_none());
        assert!(matches!(r.anchor_warning, Some(AnchorMismatch::Degenerate { .. })));
    }

    // -----------------------------------------------------------------------
    // Attribution
    // -----------------------------------------------------------------------

    #[test]
    fn absolute_and_delta_attribution_differ() {
        let mut base = SampleWindow::new(8);
        let mut load = SampleWindow::new(8);
        for i in 0..4 {
            base.push(
                PowerSample::at(i as f64)
                    .with(Rail::Cpu, 900.0)
                    .with(Rail::Ane, 0.0)
                    .with(Rail::Package, 1000.0),
            );
            load.push(
                PowerSample::at(10.0 + i as f64)
                    .with(Rail::Cpu, 1000.0)
                    .with(Rail::Ane, 900.0)
                    .with(Rail::Package, 2000.0),
            );
        }
        let cpu = attribution(Rail::Cpu, &base, &load);
        assert!(approx(cpu.absolute_share.unwrap(), 0.5));
        assert!(approx(cpu.delta_share.unwrap(), 0.1));
        let ane = attribution(Rail::Ane, &base, &load);
        assert!(approx(ane.delta_share.unwrap(), 0.9));
    }

    #[test]
    fn zero_total_delta_is_none() {
        assert!(delta_share(1.0, 2.0, 5.0, 5.0).is_none());
    }

    // -----------------------------------------------------------------------
    // Analyzer
    // -----------------------------------------------------------------------

    #[test]
    fn analyzer_window_is_bounded() {
        let mut a = Analyzer::new(AnalyzerConfig {
            window_capacity: 20,
            ..Default::default()
        });
        a.ingest((0..50).map(|i| PowerSample::at(i as f64).with(Rail::Ane, 100.0)));
        assert_eq!(a.window().len(), 20);
        let snap = a.snapshot();
        assert_eq!(snap.window_len, 20);
        assert!(snap.reports.contains_key(&Rail::Ane));
        assert!(!snap.reports.contains_key(&Rail::Gpu));
    }

    #[test]
    fn analyzer_baseline_feeds_delta() {
        let mut a = Analyzer::new(AnalyzerConfig::default());
        a.ingest((0..5).map(|i| {
            PowerSample::at(i as f64)
                .with(Rail::Ane, 0.0)
                .with(Rail::Package, 500.0)
        }));
        a.mark_baseline();
        assert!(a.window().is_empty());
        a.ingest((5..10).map(|i| {
            PowerSample::at(i as f64)
                .with(Rail::Ane, 1000.0)
                .with(Rail::Package, 1500.0)
        }));
        let ane = a
            .attributions()
            .into_iter()
            .find(|x| x.rail == Rail::Ane)
            .unwrap();
        assert!(approx(ane.delta_share.unwrap(), 1.0));
    }
}
