//! `powertap monitor`: sample power rails while an inference workload runs.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use powertap_core::inference::{InferenceStats, MAX_WORK};
use powertap_core::serial;
use powertap_core::session::detect_chip;
use powertap_core::{
    InferenceRunner, Pipeline, PipelineOptions, PowertapConfig, Rail, ReaderEvent, SerialTarget,
    SessionWriter, ShutdownCause, ShutdownState, SignalCoordinator, SyntheticInference,
};

use super::format_mw;

const GAUGE_PERIOD: Duration = Duration::from_millis(250);

pub struct MonitorCommandConfig<'a> {
    pub config: PowertapConfig,
    pub duration: Duration,
    pub interval: Option<Duration>,
    pub mock: Option<&'a str>,
    pub pattern: &'a str,
    pub serial: Option<&'a str>,
    pub output: Option<&'a str>,
    pub no_record: bool,
    pub rail: Rail,
    pub low: Option<f64>,
    pub high: Option<f64>,
    /// Busy time per synthetic inference.
    pub work: Duration,
    pub tags: &'a [String],
    pub note: Option<&'a str>,
}

/// Run the monitor command.
#[allow(clippy::too_many_lines)]
pub fn run(cfg: MonitorCommandConfig<'_>) {
    let mut config = cfg.config;
    if let Some(iv) = cfg.interval {
        config.reader.interval_ms = (iv.as_millis() as u64).max(1);
    }
    if let Some(a) = super::anchors(cfg.low, cfg.high) {
        config.analyzer.anchors.insert(cfg.rail, a);
    }
    if let Err(e) = config.validate() {
        super::fail(&e);
    }

    let source = super::open_source(cfg.mock, super::parse_pattern(cfg.pattern), &config.reader)
        .unwrap_or_else(|e| super::fail(&e));
    let source_label = match cfg.mock {
        Some(chip) => format!("mock:{chip}"),
        None => source.name().to_string(),
    };
    let chip = cfg.mock.map(str::to_string).or_else(detect_chip);

    let shutdown = ShutdownState::new();
    let _signals = SignalCoordinator::install(shutdown.clone(), |cause| {
        eprintln!("\nStopping ({cause}), flushing samples...");
    })
    .unwrap_or_else(|e| super::fail(&e));

    let session = if cfg.no_record {
        None
    } else {
        let mut sc = config.session.clone();
        if let Some(out) = cfg.output {
            sc.output_dir = PathBuf::from(out);
        }
        sc.source = source_label.clone();
        sc.chip = chip.clone();
        sc.interval_ms = config.reader.interval_ms;
        sc.tags.extend(super::parse_tags(cfg.tags));
        if let Some(note) = cfg.note {
            sc.note = Some(note.to_string());
        }
        Some(SessionWriter::new(sc).unwrap_or_else(|e| super::fail(&e)))
    };
    let session_dir = session.as_ref().map(|w| w.session_dir().to_path_buf());

    let serial = cfg.serial.map(|t| {
        let Ok(target) = t.parse::<SerialTarget>();
        serial::open(&target).boxed()
    });
    let serial_active = serial.as_ref().is_some_and(|s| s.is_active());

    let options = PipelineOptions {
        parser: config.parser,
        analyzer: config.analyzer.clone(),
        poll_timeout: config.reader.poll_timeout(),
        stall_heartbeats: config.reader.stall_heartbeats,
        sample_interval: Duration::from_millis(config.reader.interval_ms),
        session,
        serial,
        ..Default::default()
    };
    let pipeline =
        Pipeline::start(source, options, shutdown.clone()).unwrap_or_else(|e| super::fail(&e));

    if cfg.work > MAX_WORK {
        eprintln!(
            "Warning: --work {}ms exceeds {}ms; using {}ms",
            cfg.work.as_millis(),
            MAX_WORK.as_millis(),
            MAX_WORK.as_millis()
        );
    }
    let mut runner = SyntheticInference::new(cfg.work);

    println!("Monitoring power");
    println!("  Source:    {source_label}");
    if let Some(c) = &chip {
        println!("  Chip:      {c}");
    }
    println!("  Duration:  {}s", cfg.duration.as_secs_f64());
    println!("  Interval:  {}ms", config.reader.interval_ms);
    println!("  Workload:  synthetic inference, {}ms per call", runner.work().as_millis());
    println!(
        "  Serial:    {}",
        if serial_active { "forwarding ANE power" } else { "off" }
    );
    match &session_dir {
        Some(d) => println!("  Output:    {}", d.display()),
        None => println!("  Output:    not recorded"),
    }
    println!();

    let mut inference = InferenceStats::default();
    let start = Instant::now();
    let mut last_gauge: Option<Instant> = None;

    while !shutdown.is_requested() {
        if start.elapsed() >= cfg.duration {
            shutdown.request(ShutdownCause::Completed);
            break;
        }

        let t0 = Instant::now();
        if let Err(e) = runner.run_once() {
            eprintln!("\nInference failed: {e}");
            shutdown.request(ShutdownCause::Requested);
            break;
        }
        inference.record(t0.elapsed());

        while let Ok(event) = pipeline.events().try_recv() {
            match event {
                ReaderEvent::Started { source } => log::info!("reading from {source}"),
                ReaderEvent::Stalled { silent_for } => {
                    eprintln!(
                        "\nWarning: no output from {source_label} for {:.1}s",
                        silent_for.as_secs_f64()
                    );
                }
                ReaderEvent::Resumed => eprintln!("\n{source_label} resumed"),
                ReaderEvent::Exited { code } => {
                    // No automatic restart: a dead sampler ends the run.
                    let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                    eprintln!("\nWarning: {source_label} exited ({code}); stopping");
                    shutdown.request(ShutdownCause::SourceEnded);
                }
                ReaderEvent::Failed { message } => {
                    eprintln!("\nError reading {source_label}: {message}");
                    shutdown.request(ShutdownCause::SourceEnded);
                }
            }
        }

        if last_gauge.is_none_or(|t| t.elapsed() >= GAUGE_PERIOD) {
            last_gauge = Some(Instant::now());
            let latest = pipeline.bus().consume_latest();
            print!(
                "\r  ANE {:>6} mW  CPU {:>6} mW  GPU {:>6} mW  PKG {:>6} mW  | samples {:<6} runs {:<6} {:.1}s ",
                format_mw(latest.and_then(|s| s.ane_mw)),
                format_mw(latest.and_then(|s| s.cpu_mw)),
                format_mw(latest.and_then(|s| s.gpu_mw)),
                format_mw(latest.and_then(|s| s.package_mw)),
                pipeline.bus().published(),
                inference.runs,
                start.elapsed().as_secs_f64(),
            );
            let _ = std::io::Write::flush(&mut std::io::stdout());
        }
    }

    println!();
    println!();
    let cause = shutdown.cause().unwrap_or(ShutdownCause::Requested);
    let report = pipeline.finish().unwrap_or_else(|e| super::fail(&e));

    println!("Stopped ({cause}) after {:.1}s", start.elapsed().as_secs_f64());
    println!("  Samples:     {}", report.samples_recorded);
    if report.dropped > 0 {
        println!("  Dropped:     {} (recorder fell behind)", report.dropped);
    }
    println!(
        "  Parser:      {} lines, {} unrecognised, {} rejected, {} truncations",
        report.parser.lines_seen,
        report.parser.lines_dropped,
        report.parser.samples_rejected,
        report.parser.truncations
    );
    match inference.mean_ms() {
        Some(ms) => println!("  Inference:   {} runs, {ms:.1} ms mean", inference.runs),
        None => println!("  Inference:   no runs"),
    }
    if serial_active {
        println!("  Serial:      {} lines", report.serial_lines);
    }
    println!();
    super::analyze::print_snapshot(&report.analysis);
    super::analyze::print_attributions(&report.attributions);

    if let Some(dir) = &report.session_dir {
        println!();
        println!("Session saved to {}", dir.display());
        println!("  session.json: metadata and end-of-run analysis");
        println!("  samples.csv:  one row per sample");
    }

    if let Some(e) = &report.source_error {
        println!();
        super::fail(e);
    }
}
