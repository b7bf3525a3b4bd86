//! Threads that move samples from a source to disk.
//!
//! ```text
//! source ──► reader thread (parser) ──► SampleBus ──┬─► recorder thread (CSV + analyzer)
//!                                                   ├─► forwarder thread (serial, latest only)
//!                                                   └─► caller (live gauge, latest only)
//! ```
//!
//! Every thread waits at most one [`HEARTBEAT`] between checks of the shared
//! [`ShutdownState`]. [`Pipeline::finish`] requests shutdown, joins every
//! thread in dependency order, and persists the session. Nothing is left
//! detached.

use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::analysis::{AnalysisSnapshot, Analyzer, AnalyzerConfig, Attribution};
use crate::bus::{SampleBus, Subscription};
use crate::error::{PowerError, Result};
use crate::parser::{ParserConfig, ParserStats, StreamParser};
use crate::reader::{SampleSource, SourceEvent, StallDetector};
use crate::serial::SerialForwarder;
use crate::session::SessionWriter;
use crate::shutdown::{HEARTBEAT, ShutdownCause, ShutdownState};

/// Status changes reported by the reader thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    Started { source: String },
    /// No data for longer than the stall limit.
    Stalled { silent_for: Duration },
    Resumed,
    /// The source ended. `code` is the subprocess exit code, if any.
    Exited { code: Option<i32> },
    Failed { message: String },
}

pub struct PipelineOptions {
    pub parser: ParserConfig,
    pub analyzer: AnalyzerConfig,
    /// Readiness wait per source poll; clamped to [`HEARTBEAT`].
    pub poll_timeout: Duration,
    /// Stall limit in heartbeats; see [`StallDetector::limit_for`].
    pub stall_heartbeats: u32,
    /// The source's sampling interval. Gaps up to two intervals are normal.
    pub sample_interval: Duration,
    pub session: Option<SessionWriter>,
    pub serial: Option<SerialForwarder<Box<dyn Write + Send>>>,
    /// How often the serial forwarder sends the latest sample.
    pub serial_cadence: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            parser: ParserConfig::default(),
            analyzer: AnalyzerConfig::default(),
            poll_timeout: HEARTBEAT,
            stall_heartbeats: 5,
            sample_interval: Duration::from_millis(500),
            session: None,
            serial: None,
            serial_cadence: Duration::from_millis(250),
        }
    }
}

/// What a finished pipeline produced.
#[derive(Debug)]
pub struct PipelineReport {
    pub session_dir: Option<PathBuf>,
    pub parser: ParserStats,
    pub samples_recorded: u64,
    /// Samples the recorder lost to drop-oldest.
    pub dropped: u64,
    pub analysis: AnalysisSnapshot,
    pub attributions: Vec<Attribution>,
    /// `Some` when the source ended on its own.
    pub exited: Option<Option<i32>>,
    pub source_error: Option<PowerError>,
    pub serial_lines: u64,
}

impl PipelineReport {
    /// The source exit as a recoverable error, for callers that want one.
    pub fn exit_error(&self) -> Option<PowerError> {
        self.exited.map(|code| PowerError::ProcessExited { code })
    }
}

struct ReaderOutcome {
    parser: ParserStats,
    exited: Option<Option<i32>>,
    error: Option<PowerError>,
}

struct RecorderOutcome {
    writer: Option<SessionWriter>,
    analyzer: Analyzer,
    recorded: u64,
    dropped: u64,
    error: Option<PowerError>,
}

/// A running set of pipeline threads.
pub struct Pipeline {
    bus: SampleBus,
    shutdown: ShutdownState,
    events: Receiver<ReaderEvent>,
    reader: Option<JoinHandle<ReaderOutcome>>,
    recorder: Option<JoinHandle<RecorderOutcome>>,
    forwarder: Option<JoinHandle<u64>>,
}

impl Pipeline {
    pub fn start(
        source: Box<dyn SampleSource>,
        options: PipelineOptions,
        shutdown: ShutdownState,
    ) -> Result<Self> {
        Self::start_on(SampleBus::new(), source, options, shutdown)
    }

    /// Start on an existing bus. Subscriptions taken before this call see
    /// every sample the source produces.
    pub fn start_on(
        bus: SampleBus,
        source: Box<dyn SampleSource>,
        options: PipelineOptions,
        shutdown: ShutdownState,
    ) -> Result<Self> {
        // Subscribe before the reader starts so the recorder sees every sample.
        let subscription = bus.subscribe();
        let (tx, events) = mpsc::channel();

        let recorder = {
            let analyzer = Analyzer::new(options.analyzer.clone());
            let writer = options.session;
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("powertap-recorder".into())
                .spawn(move || record(subscription, writer, analyzer, shutdown))?
        };

        let forwarder = match options.serial {
            Some(fwd) if fwd.is_active() => {
                let bus = bus.clone();
                let shutdown = shutdown.clone();
                let cadence = options.serial_cadence;
                Some(
                    thread::Builder::new()
                        .name("powertap-serial".into())
                        .spawn(move || forward(fwd, bus, shutdown, cadence))?,
                )
            }
            _ => None,
        };

        let reader = {
            let bus = bus.clone();
            let shutdown = shutdown.clone();
            let parser = StreamParser::new(options.parser);
            let timeout = options.poll_timeout.min(HEARTBEAT);
            let stall = StallDetector::new(StallDetector::limit_for(
                options.stall_heartbeats,
                options.sample_interval,
            ));
            thread::Builder::new()
                .name("powertap-reader".into())
                .spawn(move || read(source, parser, stall, timeout, bus, shutdown, tx))?
        };

        Ok(Self {
            bus,
            shutdown,
            events,
            reader: Some(reader),
            recorder: Some(recorder),
            forwarder,
        })
    }

    pub fn bus(&self) -> &SampleBus {
        &self.bus
    }

    pub fn shutdown(&self) -> &ShutdownState {
        &self.shutdown
    }

    /// Reader status changes. Poll with `try_recv` or `recv_timeout`.
    pub fn events(&self) -> &Receiver<ReaderEvent> {
        &self.events
    }

    /// Whether the reader thread has ended (source exhausted or failed).
    pub fn reader_finished(&self) -> bool {
        self.reader.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop every thread, persist the session and return what was recorded.
    ///
    /// Persistence failure is returned as an error; source problems are
    /// reported inside the [`PipelineReport`].
    pub fn finish(mut self) -> Result<PipelineReport> {
        self.shutdown.request(ShutdownCause::Requested);

        let reader = join(self.reader.take(), "reader")?;
        self.bus.close();
        let recorder = join(self.recorder.take(), "recorder")?;
        let serial_lines = match self.forwarder.take() {
            Some(h) => join(Some(h), "serial")?,
            None => 0,
        };

        let analysis = recorder.analyzer.snapshot();
        let attributions = recorder.analyzer.attributions();

        let session_dir = match recorder.writer {
            Some(mut writer) => {
                writer.set_parser_stats(reader.parser);
                writer.add_dropped(recorder.dropped);
                writer.set_analysis(analysis.clone());
                Some(writer.finish()?)
            }
            None => None,
        };
        self.shutdown.seal();
        if let Some(e) = recorder.error {
            return Err(e);
        }

        Ok(PipelineReport {
            session_dir,
            parser: reader.parser,
            samples_recorded: recorder.recorded,
            dropped: recorder.dropped,
            analysis,
            attributions,
            exited: reader.exited,
            source_error: reader.error,
            serial_lines,
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.reader.is_none() && self.recorder.is_none() && self.forwarder.is_none() {
            return;
        }
        self.shutdown.request(ShutdownCause::Requested);
        if let Some(h) = self.reader.take() {
            let _ = h.join();
        }
        self.bus.close();
        if let Some(h) = self.recorder.take() {
            let _ = h.join();
        }
        if let Some(h) = self.forwarder.take() {
            let _ = h.join();
        }
    }
}

fn join<T>(handle: Option<JoinHandle<T>>, name: &str) -> Result<T> {
    handle
        .ok_or_else(|| PowerError::Io(std::io::Error::other(format!("{name} thread already joined"))))?
        .join()
        .map_err(|_| PowerError::Io(std::io::Error::other(format!("{name} thread panicked"))))
}

// ---------------------------------------------------------------------------
// Thread bodies
// ---------------------------------------------------------------------------

fn read(
    mut source: Box<dyn SampleSource>,
    mut parser: StreamParser,
    mut stall: StallDetector,
    timeout: Duration,
    bus: SampleBus,
    shutdown: ShutdownState,
    events: Sender<ReaderEvent>,
) -> ReaderOutcome {
    let _ = events.send(ReaderEvent::Started {
        source: source.name().to_string(),
    });
    let mut exited = None;
    let mut error = None;

    while !shutdown.is_requested() {
        match source.next_event(timeout) {
            Ok(SourceEvent::Data(bytes)) => {
                if stall.observe_data() {
                    log::info!("{}: input resumed", source.name());
                    let _ = events.send(ReaderEvent::Resumed);
                }
                for sample in parser.feed(&bytes) {
                    bus.publish(sample);
                }
            }
            Ok(SourceEvent::Idle) => {
                if let Some(silent_for) = stall.observe_idle() {
                    log::warn!("{}: no output for {silent_for:?}", source.name());
                    let _ = events.send(ReaderEvent::Stalled { silent_for });
                }
            }
            Ok(SourceEvent::Exited(code)) => {
                log::warn!("{} exited ({code:?})", source.name());
                let _ = events.send(ReaderEvent::Exited { code });
                exited = Some(code);
                break;
            }
            Err(e) => {
                log::error!("{}: {e}", source.name());
                let _ = events.send(ReaderEvent::Failed {
                    message: e.to_string(),
                });
                error = Some(e);
                break;
            }
        }
    }

    for sample in parser.finish() {
        bus.publish(sample);
    }
    if let Err(e) = source.stop() {
        log::warn!("failed to stop {}: {e}", source.name());
    }
    bus.close();

    ReaderOutcome {
        parser: parser.stats(),
        exited,
        error,
    }
}

fn record(
    subscription: Subscription,
    mut writer: Option<SessionWriter>,
    mut analyzer: Analyzer,
    shutdown: ShutdownState,
) -> RecorderOutcome {
    let mut recorded = 0u64;
    let mut error = None;

    loop {
        let batch = subscription.recv_timeout(HEARTBEAT);
        if shutdown.is_accepting() {
            if let Some(w) = writer.as_mut() {
                for sample in &batch {
                    if let Err(e) = w.write_sample(sample) {
                        log::error!("{e}");
                        error = Some(e);
                        break;
                    }
                    recorded += 1;
                }
                if error.is_some() {
                    break;
                }
            } else {
                recorded += batch.len() as u64;
            }
            analyzer.ingest(batch);
        }
        if subscription.is_finished() {
            break;
        }
    }

    RecorderOutcome {
        writer,
        analyzer,
        recorded,
        dropped: subscription.dropped(),
        error,
    }
}

fn forward(
    mut forwarder: SerialForwarder<Box<dyn Write + Send>>,
    bus: SampleBus,
    shutdown: ShutdownState,
    cadence: Duration,
) -> u64 {
    let mut last_ts = f64::NEG_INFINITY;
    while !shutdown.sleep(cadence) && !bus.is_closed() {
        if let Some(sample) = bus.consume_latest()
            && sample.timestamp > last_ts
        {
            last_ts = sample.timestamp;
            forwarder.forward(&sample);
        }
        if !forwarder.is_active() {
            break;
        }
    }
    forwarder.lines_written()
}
