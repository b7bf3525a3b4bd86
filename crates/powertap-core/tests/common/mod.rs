//! Shared signal scenario. Handlers can be installed once per process, so
//! each signal gets its own test binary that calls into here.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use powertap_core::session::{SAMPLES_FILE, SessionConfig, SessionWriter, read_samples_csv};
use powertap_core::{
    LoadPattern, MockProfile, Pipeline, PipelineOptions, ShutdownCause, ShutdownState,
    SignalCoordinator, SimulatedSource,
};

/// Record from a paced mock source, deliver `signal` to ourselves, and check
/// that everything recorded before it reached disk intact.
pub fn run_signal_scenario(signal: libc::c_int) {
    let tmp = tempfile::tempdir().unwrap();
    let state = ShutdownState::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let _signals = SignalCoordinator::install(state.clone(), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    let writer = SessionWriter::new(SessionConfig {
        output_dir: tmp.path().to_path_buf(),
        source: "mock:M1".into(),
        ..Default::default()
    })
    .unwrap();
    let source = SimulatedSource::new(
        MockProfile::for_chip("M1"),
        LoadPattern::default(),
        Duration::from_millis(10),
    )
    .with_seed(7);
    let options = PipelineOptions {
        session: Some(writer),
        ..Default::default()
    };
    let pipeline = Pipeline::start(Box::new(source), options, state.clone()).unwrap();

    std::thread::sleep(Duration::from_millis(300));
    let published_before = pipeline.bus().published();
    // SAFETY: signalling our own process with a handled signal.
    unsafe {
        libc::kill(libc::getpid(), signal);
    }

    let sent = Instant::now();
    while !state.is_requested() {
        assert!(sent.elapsed() < Duration::from_secs(1), "signal not observed");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(state.cause(), Some(ShutdownCause::Signal));

    let report = pipeline.finish().unwrap();
    assert!(sent.elapsed() < Duration::from_secs(1), "shutdown took {:?}", sent.elapsed());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!state.is_accepting());

    let dir = report.session_dir.unwrap();
    let raw = std::fs::read_to_string(dir.join(SAMPLES_FILE)).unwrap();
    assert!(raw.ends_with('\n'), "last row is unterminated");
    let rows = read_samples_csv(&dir).unwrap();
    assert!(published_before > 0);
    assert!(
        rows.len() as u64 >= published_before,
        "{} rows on disk, {published_before} published before the signal",
        rows.len()
    );
    assert_eq!(rows.len() as u64, report.samples_recorded);
    assert!(dir.join("session.json").is_file());
}
