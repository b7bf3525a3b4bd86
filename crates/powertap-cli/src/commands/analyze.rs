//! `powertap analyze`: replay a recorded CSV through the analyzer.

use std::path::Path;

use powertap_core::session::read_samples_csv;
use powertap_core::{AnalysisSnapshot, Analyzer, Attribution, PowertapConfig, Rail};

pub struct AnalyzeCommandConfig<'a> {
    pub path: &'a str,
    pub config: PowertapConfig,
    pub rail: Rail,
    pub low: Option<f64>,
    pub high: Option<f64>,
    /// Analyze only the last N samples instead of the whole recording.
    pub window: Option<usize>,
    pub output: Option<&'a str>,
}

/// Run the analyze command.
pub fn run(cfg: AnalyzeCommandConfig<'_>) {
    let samples = read_samples_csv(Path::new(cfg.path)).unwrap_or_else(|e| super::fail(&e));
    if samples.is_empty() {
        println!("No samples in {}", cfg.path);
        return;
    }

    let mut analyzer_cfg = cfg.config.analyzer;
    analyzer_cfg.window_capacity = cfg.window.unwrap_or(samples.len()).max(1);
    if let Some(a) = super::anchors(cfg.low, cfg.high) {
        analyzer_cfg.anchors.insert(cfg.rail, a);
    }

    let total = samples.len();
    let mut analyzer = Analyzer::new(analyzer_cfg);
    analyzer.ingest(samples);
    let snapshot = analyzer.snapshot();

    println!("Replayed {total} samples from {}", cfg.path);
    println!();
    print_snapshot(&snapshot);

    if let Some(path) = cfg.output {
        let json = match serde_json::to_string_pretty(&snapshot) {
            Ok(j) => j,
            Err(e) => {
                eprintln!("Error serializing analysis: {e}");
                std::process::exit(1);
            }
        };
        if let Err(e) = std::fs::write(path, json) {
            eprintln!("Error writing {path}: {e}");
            std::process::exit(1);
        }
        println!();
        println!("Analysis written to {path}");
    }
}

/// Per-rail divergence table.
pub fn print_snapshot(snapshot: &AnalysisSnapshot) {
    if snapshot.reports.is_empty() {
        println!("No rail had enough samples to analyze.");
        return;
    }

    println!(
        "{:<8} {:>8} {:>10} {:>10} {:>11} {:<13} {:>8}",
        "Rail", "Samples", "Mean mW", "Median mW", "Divergence", "Shape", "At low"
    );
    println!("{}", "-".repeat(74));
    for (rail, r) in &snapshot.reports {
        let fraction = r
            .drop_or_burst_fraction
            .map_or_else(|| "-".to_string(), |f| format!("{:.1}%", f * 100.0));
        let flag = if r.significant { " *" } else { "" };
        println!(
            "{:<8} {:>8} {:>10.1} {:>10.1} {:>10.2}% {:<13} {:>8}{}",
            rail.to_string(),
            r.samples,
            r.mean_mw,
            r.median_mw,
            r.divergence_pct,
            r.skew_direction.to_string(),
            fraction,
            flag,
        );
    }

    let warnings: Vec<_> = snapshot
        .reports
        .iter()
        .filter_map(|(rail, r)| r.anchor_warning.map(|w| (rail, w)))
        .collect();
    if snapshot.reports.values().any(|r| r.significant) {
        println!();
        println!("  * mean and median diverge: the rail is bursting or dropping out under a flat baseline");
    }
    for (rail, w) in warnings {
        println!("  warning: {rail}: {w}");
    }
}

/// Component shares of package power.
pub fn print_attributions(attributions: &[Attribution]) {
    let rows: Vec<_> = attributions
        .iter()
        .filter(|a| a.absolute_share.is_some() || a.delta_share.is_some())
        .collect();
    if rows.is_empty() {
        return;
    }
    println!();
    println!("{:<8} {:>10} {:>10}", "Rail", "Share", "Δ share");
    println!("{}", "-".repeat(30));
    for a in rows {
        let pct = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |s| format!("{:.1}%", s * 100.0));
        println!(
            "{:<8} {:>10} {:>10}",
            a.rail.to_string(),
            pct(a.absolute_share),
            pct(a.delta_share)
        );
    }
}
