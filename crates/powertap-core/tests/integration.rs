//! Integration tests for powertap-core.
//!
//! These drive the full path: text stream → parser → sample bus → analyzer,
//! plus persistence and the subprocess reader against `/bin/sh` scripts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use powertap_core::analysis::{Analyzer, AnalyzerConfig, Anchors, SkewDirection};
use powertap_core::parser::{MAX_BUFFER_BYTES, StreamParser};
use powertap_core::reader::{SampleSource, SourceEvent, SubprocessReader};
use powertap_core::session::{SAMPLES_FILE, SessionConfig, SessionWriter, read_samples_csv};
use powertap_core::{
    LoadPattern, MockProfile, Pipeline, PipelineOptions, PowerSample, Rail, ReaderEvent,
    SampleBus, ShutdownCause, ShutdownState, SimulatedSource,
};

fn parse_all(text: &str) -> Vec<PowerSample> {
    let mut parser = StreamParser::default();
    let mut samples = parser.feed(text.as_bytes());
    samples.extend(parser.finish());
    samples
}

/// Parser → bus → subscription → analyzer.
fn analyze(text: &str, config: AnalyzerConfig) -> Analyzer {
    let bus = SampleBus::new();
    let sub = bus.subscribe();
    for s in parse_all(text) {
        bus.publish(s);
    }
    bus.close();
    let mut analyzer = Analyzer::new(config);
    analyzer.ingest(sub.drain_all());
    analyzer
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

#[test]
fn constant_stream_is_symmetric() {
    let text = "ANE Power: 1200.0 mW\nCPU Power: 600.0 mW\n".repeat(20);
    let analyzer = analyze(&text, AnalyzerConfig::default());
    assert_eq!(analyzer.window().len(), 20);

    let report = analyzer.report(Rail::Ane).unwrap();
    assert!(report.divergence_pct.abs() < 1e-9);
    assert_eq!(report.skew_direction, SkewDirection::Symmetric);
    assert_eq!(report.mean_mw, 1200.0);

    let cpu = analyzer.report(Rail::Cpu).unwrap();
    assert_eq!(cpu.skew_direction, SkewDirection::Symmetric);
}

#[test]
fn half_low_half_high_solves_to_half() {
    let mut text = "ANE Power: 800 mW\n".repeat(10);
    text.push_str(&"ANE Power: 2500 mW\n".repeat(10));

    let mut config = AnalyzerConfig::default();
    config.anchors.insert(Rail::Ane, Anchors::new(800.0, 2500.0));
    let analyzer = analyze(&text, config);

    let report = analyzer.report(Rail::Ane).unwrap();
    assert_eq!(report.samples, 20);
    let fraction = report.drop_or_burst_fraction.unwrap();
    assert!((fraction - 0.5).abs() < 1e-9, "fraction {fraction}");
    assert!(report.anchor_warning.is_none());
}

#[test]
fn unterminated_flood_stays_bounded() {
    let mut parser = StreamParser::default();
    let chunk = vec![b'x'; 4096];
    for _ in 0..1024 {
        assert!(parser.feed(&chunk).is_empty());
        assert!(parser.buffered_bytes() <= MAX_BUFFER_BYTES);
    }
    assert!(parser.stats().truncations > 0);

    // The stream recovers once lines arrive again.
    let samples = parser.feed(b"\nANE Power: 5 mW\nANE Power: 6 mW\n");
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].ane_mw, Some(5.0));
}

#[test]
fn format_drift_is_tolerated() {
    let text = "\
*** Sampled system activity (Sat Oct 19 10:00:00 2026 +0000) (500.12ms elapsed) ***
CPU Power: 812 mW
GPU Power: 44 mW
ANE Power: 0 mW
Combined Power (CPU + GPU + ANE): 856 mW
*** Sampled system activity (Sat Oct 19 10:00:01 2026 +0000) (500.04ms elapsed) ***
Intel energy model derived package power (CPUs+GT+SA): 1.63W
CPU 0 frequency: 2600 MHz
*** Sampled system activity (Sat Oct 19 10:00:02 2026 +0000) (500.04ms elapsed) ***
ANE: 12 mW
CPU Power: not-a-number mW
";
    let samples = parse_all(text);
    assert_eq!(samples.len(), 3);
    assert_eq!(samples[0].package_mw, Some(856.0));
    assert_eq!(samples[1].package_mw, Some(1630.0));
    assert_eq!(samples[2].ane_mw, Some(12.0));
    assert_eq!(samples[2].cpu_mw, None);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn csv_round_trip_preserves_rows_and_order() {
    let tmp = tempfile::tempdir().unwrap();
    let mut writer = SessionWriter::new(SessionConfig {
        output_dir: tmp.path().to_path_buf(),
        source: "test".into(),
        ..Default::default()
    })
    .unwrap();

    let written: Vec<PowerSample> = (0..500)
        .map(|i| {
            let t = i as f64 * 0.1 + 0.000_123;
            let mut s = PowerSample::at(t)
                .with(Rail::Cpu, 300.0 + (i as f64 * 1.7).sin() * 100.0)
                .with(Rail::Package, 5000.0 + i as f64 / 3.0);
            if i % 3 != 0 {
                s = s.with(Rail::Ane, 1234.567_891 * (i as f64).sqrt());
            }
            s
        })
        .collect();
    for s in &written {
        writer.write_sample(s).unwrap();
    }
    let dir = writer.finish().unwrap();

    let read = read_samples_csv(&dir).unwrap();
    assert_eq!(read.len(), written.len());
    for (a, b) in written.iter().zip(&read) {
        assert!((a.timestamp - b.timestamp).abs() < 1e-6);
        for rail in Rail::ALL {
            match (a.get(rail), b.get(rail)) {
                (Some(x), Some(y)) => assert!((x - y).abs() < 1e-6, "{rail}: {x} vs {y}"),
                (None, None) => {}
                other => panic!("{rail} presence changed: {other:?}"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Subprocess reader
// ---------------------------------------------------------------------------

#[test]
fn subprocess_output_reaches_the_recorder() {
    let script = r#"for i in 1 2 3; do printf '*** Sampled system activity\nANE Power: %s00 mW\nCPU Power: 10 mW\n' "$i"; sleep 0.05; done"#;
    let reader = SubprocessReader::spawn("/bin/sh", &["-c", script], Duration::from_secs(2)).unwrap();
    let pipeline = Pipeline::start(Box::new(reader), PipelineOptions::default(), ShutdownState::new()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !pipeline.reader_finished() {
        assert!(Instant::now() < deadline, "reader never finished");
        std::thread::sleep(Duration::from_millis(10));
    }
    let report = pipeline.finish().unwrap();
    assert_eq!(report.samples_recorded, 3);
    assert_eq!(report.exited, Some(Some(0)));
    assert_eq!(report.analysis.reports[&Rail::Ane].mean_mw, 200.0);
}

#[test]
fn subprocess_crash_is_recoverable() {
    let reader = SubprocessReader::spawn("/bin/sh", &["-c", "exit 7"], Duration::from_secs(2)).unwrap();
    let pipeline = Pipeline::start(Box::new(reader), PipelineOptions::default(), ShutdownState::new()).unwrap();
    let mut saw_exit = false;
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(ReaderEvent::Exited { code }) = pipeline.events().recv_timeout(Duration::from_millis(100)) {
            assert_eq!(code, Some(7));
            saw_exit = true;
            break;
        }
    }
    assert!(saw_exit);
    let report = pipeline.finish().unwrap();
    let err = report.exit_error().unwrap();
    assert!(err.is_recoverable());
}

/// A source that never produces anything.
struct Silent;

impl SampleSource for Silent {
    fn name(&self) -> &str {
        "silent"
    }

    fn next_event(&mut self, timeout: Duration) -> powertap_core::Result<SourceEvent> {
        std::thread::sleep(timeout.min(Duration::from_millis(10)));
        Ok(SourceEvent::Idle)
    }

    fn stop(&mut self) -> powertap_core::Result<()> {
        Ok(())
    }
}

#[test]
fn stalled_input_is_reported_without_blocking_shutdown() {
    let options = PipelineOptions {
        stall_heartbeats: 5,
        sample_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let pipeline = Pipeline::start(Box::new(Silent), options, ShutdownState::new()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut stalled = None;
    while stalled.is_none() && Instant::now() < deadline {
        if let Ok(ReaderEvent::Stalled { silent_for }) = pipeline.events().recv_timeout(Duration::from_millis(100)) {
            stalled = Some(silent_for);
        }
    }
    let silent_for = stalled.expect("stall was never reported");
    assert!(silent_for > Duration::from_millis(500));
    assert!(silent_for < Duration::from_secs(2));

    let start = Instant::now();
    let report = pipeline.finish().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(report.samples_recorded, 0);
}

#[test]
fn shutdown_under_full_cpu_contention_flushes_everything() {
    let tmp = tempfile::tempdir().unwrap();
    let writer = SessionWriter::new(SessionConfig {
        output_dir: tmp.path().to_path_buf(),
        source: "mock:M2".into(),
        ..Default::default()
    })
    .unwrap();
    let source = SimulatedSource::new(
        MockProfile::for_chip("M2"),
        LoadPattern::default(),
        Duration::from_millis(10),
    )
    .with_seed(3);
    let options = PipelineOptions {
        session: Some(writer),
        ..Default::default()
    };
    let state = ShutdownState::new();
    let pipeline = Pipeline::start(Box::new(source), options, state.clone()).unwrap();

    let spinning = Arc::new(AtomicBool::new(true));
    let cores = std::thread::available_parallelism().map_or(2, |n| n.get());
    let spinners: Vec<_> = (0..cores * 2)
        .map(|_| {
            let spinning = Arc::clone(&spinning);
            std::thread::spawn(move || {
                let mut x = 0u64;
                while spinning.load(Ordering::Relaxed) {
                    x = std::hint::black_box(x.wrapping_mul(31).wrapping_add(7));
                }
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(500));
    let published_before = pipeline.bus().published();
    let start = Instant::now();
    state.request(ShutdownCause::Signal);
    let report = pipeline.finish().unwrap();
    let took = start.elapsed();

    spinning.store(false, Ordering::Relaxed);
    for h in spinners {
        h.join().unwrap();
    }

    assert!(took < Duration::from_secs(2), "shutdown took {took:?}");
    let dir = report.session_dir.unwrap();
    let raw = std::fs::read_to_string(dir.join(SAMPLES_FILE)).unwrap();
    assert!(raw.ends_with('\n'));
    let rows = read_samples_csv(&dir).unwrap();
    assert!(published_before > 0);
    assert!(rows.len() as u64 >= published_before);
    assert_eq!(rows.len() as u64, report.samples_recorded);
}

#[test]
#[ignore] // Needs macOS and root: sudo cargo test -- --ignored
fn real_powermetrics_produces_samples() {
    let config = powertap_core::ReaderConfig::default();
    let mut reader = SubprocessReader::start(&config).unwrap();
    let mut parser = StreamParser::default();
    let mut samples = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while samples.len() < 2 && Instant::now() < deadline {
        if let Some(bytes) = reader.poll(Duration::from_millis(100)).unwrap() {
            samples.extend(parser.feed(&bytes));
        }
    }
    reader.stop().unwrap();
    assert!(samples.len() >= 2);
}
