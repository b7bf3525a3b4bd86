//! # powertap-core
//!
//! **Watch the Neural Engine draw power while your model runs.**
//!
//! `powertap-core` samples ANE, CPU, GPU and package power from Apple's
//! `powermetrics`, hands samples to any number of consumers, and explains
//! the shape of what it sees: is the baseline flat, is something bursting
//! underneath it, and is elevated idle power real work or waste.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use powertap_core::{LoadPattern, MockProfile, Pipeline, PipelineOptions, ShutdownState, SimulatedSource};
//!
//! let source = SimulatedSource::new(MockProfile::for_chip("M2"), LoadPattern::default(), Duration::from_millis(100));
//! let shutdown = ShutdownState::new();
//! let pipeline = Pipeline::start(Box::new(source), PipelineOptions::default(), shutdown.clone()).unwrap();
//! shutdown.sleep(Duration::from_secs(2));
//! let report = pipeline.finish().unwrap();
//! println!("{} samples", report.samples_recorded);
//! ```
//!
//! ## Architecture
//!
//! Source → Parser → SampleBus → {recorder + analyzer, serial forwarder, live display}
//!
//! The source is either the real `powermetrics` subprocess
//! ([`SubprocessReader`]) or a [`SimulatedSource`]; both implement
//! [`SampleSource`]. Every loop waits at most [`shutdown::HEARTBEAT`] between
//! checks of the shared [`ShutdownState`].

pub mod analysis;
pub mod baseline;
pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod inference;
pub mod parser;
pub mod pipeline;
pub mod reader;
pub mod sample;
pub mod serial;
pub mod session;
pub mod shutdown;
pub mod simulate;
pub mod thermal;

pub use analysis::{
    AnalysisSnapshot, Analyzer, AnalyzerConfig, AnchorMismatch, Anchors, Attribution,
    DivergenceReport, FractionEstimate, SkewDirection, divergence, rail_burst_fraction,
    solve_burst_fraction,
};
pub use baseline::{
    BaselineAssessment, BaselineConfig, BaselineState, CorePlacement, CpuUtilization,
    StabilizationConfig, StabilizationOutcome, SysinfoCpu, classify, wait_for_stable_baseline,
};
pub use bus::{SampleBus, Subscription};
pub use config::PowertapConfig;
pub use error::{PowerError, Result};
pub use inference::{InferenceRunner, SyntheticInference};
pub use parser::{ParserConfig, ParserStats, StreamParser};
pub use pipeline::{Pipeline, PipelineOptions, PipelineReport, ReaderEvent};
pub use reader::{ReaderConfig, SampleSource, Sampler, SourceEvent, StallDetector, SubprocessReader};
pub use sample::{PowerSample, Rail, SampleWindow};
pub use serial::{SerialForwarder, SerialTarget};
pub use session::{SessionConfig, SessionMeta, SessionWriter};
pub use shutdown::{ShutdownCause, ShutdownState, SignalCoordinator};
pub use simulate::{LoadPattern, MockProfile, SimulatedSource};
pub use thermal::{ExecutionPattern, ProfileTable, ThermalProfile, recommend_execution};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
