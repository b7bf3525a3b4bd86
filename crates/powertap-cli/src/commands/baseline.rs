//! `powertap baseline`: measure idle power and judge whether it is real work.

use std::time::Duration;

use powertap_core::baseline::{BaselineAssessment, classify};
use powertap_core::{
    CorePlacement, CpuUtilization, Pipeline, PipelineOptions, PowertapConfig, SampleBus,
    ShutdownState, SignalCoordinator, StabilizationOutcome, SysinfoCpu, wait_for_stable_baseline,
};

pub struct BaselineCommandConfig<'a> {
    pub config: PowertapConfig,
    pub mock: Option<&'a str>,
    pub pattern: &'a str,
    pub placement: CorePlacement,
    pub ceiling: Option<Duration>,
    pub interval: Option<Duration>,
    pub json: bool,
}

/// Run the baseline command.
pub fn run(cfg: BaselineCommandConfig<'_>) {
    let mut config = cfg.config;
    if let Some(iv) = cfg.interval {
        config.reader.interval_ms = (iv.as_millis() as u64).max(1);
    }
    if let Some(c) = cfg.ceiling {
        config.stabilization.ceiling_secs = c.as_secs().max(1);
    }
    if let Err(e) = config.validate() {
        super::fail(&e);
    }
    let rail = config.baseline.rail;

    let source = super::open_source(cfg.mock, super::parse_pattern(cfg.pattern), &config.reader)
        .unwrap_or_else(|e| super::fail(&e));
    let source_name = source.name().to_string();

    let shutdown = ShutdownState::new();
    let _signals = SignalCoordinator::install(shutdown.clone(), |cause| {
        log::debug!("baseline wait interrupted ({cause})");
    })
    .unwrap_or_else(|e| super::fail(&e));

    let options = PipelineOptions {
        parser: config.parser,
        analyzer: config.analyzer.clone(),
        poll_timeout: config.reader.poll_timeout(),
        stall_heartbeats: config.reader.stall_heartbeats,
        sample_interval: Duration::from_millis(config.reader.interval_ms),
        ..Default::default()
    };
    let bus = SampleBus::new();
    let subscription = bus.subscribe();
    let pipeline = Pipeline::start_on(bus, source, options, shutdown.clone())
        .unwrap_or_else(|e| super::fail(&e));

    if !cfg.json {
        println!("Measuring {rail} baseline from {source_name}");
        println!(
            "  Waiting up to {}s for {} settled samples (spread ≤ {:.0}%, divergence ≤ {:.0}%)",
            config.stabilization.ceiling_secs,
            config.stabilization.window_samples,
            config.stabilization.max_spread_pct,
            config.stabilization.max_divergence_pct,
        );
    }

    let outcome = wait_for_stable_baseline(&subscription, rail, &config.stabilization, &shutdown);
    drop(subscription);

    let cpu_util = SysinfoCpu::new().sample_pct();
    let report = pipeline.finish().unwrap_or_else(|e| super::fail(&e));
    if let Some(e) = &report.source_error {
        super::fail(e);
    }

    let (baseline_mw, settled, waited) = match outcome {
        StabilizationOutcome::Stable {
            waited,
            baseline_mw,
        } => (baseline_mw, true, waited),
        StabilizationOutcome::TimedOut {
            waited,
            last_mw: Some(mw),
        } => (mw, false, waited),
        StabilizationOutcome::TimedOut { last_mw: None, .. } => {
            eprintln!("error: no {rail} samples arrived from {source_name}");
            std::process::exit(1);
        }
        StabilizationOutcome::Interrupted => {
            println!();
            println!("Interrupted before the baseline settled.");
            return;
        }
    };

    let assessment = classify(baseline_mw, cpu_util, cfg.placement, &config.baseline);

    if cfg.json {
        let out = serde_json::json!({
            "rail": rail,
            "settled": settled,
            "waited_ms": waited.as_millis() as u64,
            "assessment": assessment,
        });
        match serde_json::to_string_pretty(&out) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("Error serializing assessment: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    println!();
    if settled {
        println!("  Settled after {:.1}s", waited.as_secs_f64());
    } else {
        println!(
            "  Did not settle within {:.0}s; using the median of what was seen",
            waited.as_secs_f64()
        );
    }
    print_assessment(&assessment);
}

fn print_assessment(a: &BaselineAssessment) {
    println!("  Baseline:  {:.0} mW (threshold {:.0} mW)", a.baseline_mw, a.threshold_mw);
    match a.cpu_util_pct {
        Some(u) => println!("  CPU util:  {u:.1}%"),
        None => println!("  CPU util:  unavailable"),
    }
    println!("  State:     {}", a.state);
    if a.excess_mw > 0.0 {
        println!("  Excess:    {:.0} mW", a.excess_mw);
        println!("    legitimate ≈ {:.0} mW", a.legitimate_mw);
        println!("    wasted     ≈ {:.0} mW", a.wasted_mw);
    }
}
