//! Sample sources: the `powermetrics` subprocess and anything that can stand
//! in for it.
//!
//! A [`SampleSource`] yields raw text chunks in `powermetrics` format. The
//! pipeline feeds them to a [`StreamParser`](crate::parser::StreamParser)
//! without caring whether they came from a real child process or from
//! [`SimulatedSource`](crate::simulate::SimulatedSource).
//!
//! [`SubprocessReader`] never blocks longer than the timeout handed to
//! [`SubprocessReader::poll`]: it waits on the child's stdout with
//! `poll(2)` and reads from a non-blocking descriptor.

use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{PowerError, Result};

/// The sampling binary.
pub const POWERMETRICS: &str = "powermetrics";

/// Bytes read per `read(2)` call.
const READ_CHUNK: usize = 8 * 1024;
/// Cap on bytes drained in one [`SubprocessReader::poll`].
const MAX_READ_PER_POLL: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// `powermetrics` sampler names the reader can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampler {
    CpuPower,
    GpuPower,
    AnePower,
    Thermal,
}

impl Sampler {
    pub fn as_arg(self) -> &'static str {
        match self {
            Self::CpuPower => "cpu_power",
            Self::GpuPower => "gpu_power",
            Self::AnePower => "ane_power",
            Self::Thermal => "thermal",
        }
    }

    /// The samplers needed for every rail.
    pub fn power_rails() -> Vec<Sampler> {
        vec![Self::CpuPower, Self::GpuPower, Self::AnePower]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Binary to launch.
    pub program: String,
    /// Sampling interval passed as `-i`.
    pub interval_ms: u64,
    pub samplers: Vec<Sampler>,
    /// Readiness wait per poll. Clamped to the shutdown heartbeat.
    pub poll_timeout_ms: u64,
    /// Time between SIGTERM and SIGKILL on stop.
    pub stop_grace_ms: u64,
    /// Silence tolerated before input counts as stalled, in heartbeats.
    /// Never less than two sampling intervals.
    pub stall_heartbeats: u32,
    /// Refuse to spawn unless running as root.
    pub require_root: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            program: POWERMETRICS.to_string(),
            interval_ms: 500,
            samplers: Sampler::power_rails(),
            poll_timeout_ms: 100,
            stop_grace_ms: 2000,
            stall_heartbeats: 5,
            require_root: true,
        }
    }
}

impl ReaderConfig {
    /// Arguments for a `powermetrics` invocation.
    pub fn args(&self) -> Vec<String> {
        let samplers: Vec<&str> = self.samplers.iter().map(|s| s.as_arg()).collect();
        vec![
            "--samplers".to_string(),
            samplers.join(","),
            "-i".to_string(),
            self.interval_ms.max(1).to_string(),
        ]
    }

    /// Silence after which input counts as stalled.
    pub fn stall_limit(&self) -> Duration {
        StallDetector::limit_for(self.stall_heartbeats, Duration::from_millis(self.interval_ms))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms).min(crate::shutdown::HEARTBEAT)
    }
}

// ---------------------------------------------------------------------------
// Source seam
// ---------------------------------------------------------------------------

/// What one bounded wait on a source produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// Raw output bytes, possibly ending mid-line.
    Data(Vec<u8>),
    /// Nothing arrived within the timeout.
    Idle,
    /// The source has ended. For a subprocess this carries its exit code
    /// (`None` when killed by a signal).
    Exited(Option<i32>),
}

/// Anything that produces `powermetrics`-format text.
pub trait SampleSource: Send {
    /// Short label for logs and session metadata.
    fn name(&self) -> &str;

    /// Wait at most `timeout` for output.
    fn next_event(&mut self, timeout: Duration) -> Result<SourceEvent>;

    /// Release the source. Must be safe to call more than once.
    fn stop(&mut self) -> Result<()>;
}

/// Reports when a source has produced no data for longer than its limit.
///
/// The limit is wall time, so a slow sampling interval with many idle polls
/// between blocks is not a stall.
#[derive(Debug, Clone)]
pub struct StallDetector {
    limit: Duration,
    last_data: Instant,
    stalled: bool,
}

impl StallDetector {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            last_data: Instant::now(),
            stalled: false,
        }
    }

    /// Limit for a source sampling every `interval`: the larger of
    /// `heartbeats` shutdown heartbeats and two intervals.
    pub fn limit_for(heartbeats: u32, interval: Duration) -> Duration {
        (crate::shutdown::HEARTBEAT * heartbeats).max(interval * 2)
    }

    /// Record an idle poll. Returns how long the source has been silent on
    /// the transition into the stalled condition, and `None` otherwise.
    pub fn observe_idle(&mut self) -> Option<Duration> {
        self.observe_idle_at(Instant::now())
    }

    fn observe_idle_at(&mut self, now: Instant) -> Option<Duration> {
        let silent = now.saturating_duration_since(self.last_data);
        if !self.stalled && silent > self.limit {
            self.stalled = true;
            return Some(silent);
        }
        None
    }

    /// Record a poll that produced data. Returns `true` if this ends a stall.
    pub fn observe_data(&mut self) -> bool {
        self.last_data = Instant::now();
        std::mem::replace(&mut self.stalled, false)
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }
}

// ---------------------------------------------------------------------------
// Subprocess reader
// ---------------------------------------------------------------------------

/// Check if a command exists by running `which`.
pub fn command_exists(name: &str) -> bool {
    if name.contains('/') {
        return std::path::Path::new(name).is_file();
    }
    Command::new("which")
        .arg(name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

/// Owns a long-lived child process and drains its stdout without blocking.
pub struct SubprocessReader {
    program: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    grace: Duration,
    eof: bool,
    exit_code: Option<Option<i32>>,
}

impl std::fmt::Debug for SubprocessReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessReader")
            .field("program", &self.program)
            .field("pid", &self.pid())
            .field("eof", &self.eof)
            .finish()
    }
}

impl SubprocessReader {
    /// Launch `powermetrics` with the configured samplers and interval.
    ///
    /// Reports a missing binary as [`PowerError::BinaryMissing`] and a
    /// non-root caller as [`PowerError::PermissionDenied`] before spawning.
    pub fn start(config: &ReaderConfig) -> Result<Self> {
        if !command_exists(&config.program) {
            return Err(PowerError::BinaryMissing {
                program: config.program.clone(),
            });
        }
        if config.require_root && !is_root() {
            return Err(PowerError::PermissionDenied {
                program: config.program.clone(),
            });
        }
        Self::spawn(
            &config.program,
            &config.args(),
            Duration::from_millis(config.stop_grace_ms),
        )
    }

    /// Launch an arbitrary command whose stdout carries sampler text.
    pub fn spawn<S: AsRef<str>>(program: &str, args: &[S], grace: Duration) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args.iter().map(AsRef::as_ref))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PowerError::from_spawn(program, e))?;

        let stdout = match child.stdout.take() {
            Some(s) => s,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PowerError::Spawn {
                    program: program.to_string(),
                    source: io::Error::other("child stdout was not captured"),
                });
            }
        };
        if let Err(e) = set_nonblocking(&stdout) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PowerError::Io(e));
        }

        log::info!("started {program} (pid {})", child.id());
        Ok(Self {
            program: program.to_string(),
            child: Some(child),
            stdout: Some(stdout),
            grace,
            eof: false,
            exit_code: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Wait up to `timeout` for output. `Ok(None)` on timeout or after EOF.
    pub fn poll(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if self.eof {
            return Ok(None);
        }
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        if !wait_readable(stdout, timeout)? {
            return Ok(None);
        }

        let mut out = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        while out.len() < MAX_READ_PER_POLL {
            match stdout.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    log::debug!("{}: stdout closed", self.program);
                    break;
                }
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PowerError::Io(e)),
            }
        }
        Ok(if out.is_empty() { None } else { Some(out) })
    }

    /// Exit status if the child has already exited.
    pub fn try_exit(&mut self) -> Result<Option<Option<i32>>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        match child.try_wait()? {
            Some(status) => {
                self.exit_code = Some(status.code());
                Ok(self.exit_code)
            }
            None => Ok(None),
        }
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL. The process
    /// handle and stdout are released on every path.
    pub fn stop(&mut self) -> Result<Option<i32>> {
        drop(self.stdout.take());
        let Some(mut child) = self.child.take() else {
            return Ok(self.exit_code.flatten());
        };
        let (program, grace) = (self.program.as_str(), self.grace);
        let code = stop_or_kill(&mut child, |c| terminate_within(c, program, grace))?;
        self.exit_code = Some(code);
        Ok(code)
    }
}

/// Run `stop` on `child`; if it fails, kill and reap the child before
/// returning the error.
fn stop_or_kill<F>(child: &mut Child, stop: F) -> io::Result<Option<i32>>
where
    F: FnOnce(&mut Child) -> io::Result<Option<i32>>,
{
    stop(child).inspect_err(|e| {
        log::warn!("stopping pid {} failed ({e}), killing", child.id());
        let _ = child.kill();
        let _ = child.wait();
    })
}

fn terminate_within(child: &mut Child, program: &str, grace: Duration) -> io::Result<Option<i32>> {
    if let Some(status) = child.try_wait()? {
        return Ok(status.code());
    }

    terminate(child);
    let start = Instant::now();
    while start.elapsed() < grace {
        if let Some(status) = child.try_wait()? {
            log::info!("{program} exited after SIGTERM");
            return Ok(status.code());
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    log::warn!("{program} ignored SIGTERM for {grace:?}, killing");
    let _ = child.kill();
    Ok(child.wait()?.code())
}

impl SampleSource for SubprocessReader {
    fn name(&self) -> &str {
        &self.program
    }

    fn next_event(&mut self, timeout: Duration) -> Result<SourceEvent> {
        if let Some(bytes) = self.poll(timeout)? {
            return Ok(SourceEvent::Data(bytes));
        }
        if !self.eof {
            if let Some(code) = self.try_exit()? {
                // The child may have written its last block just before exiting.
                if let Some(bytes) = self.poll(Duration::ZERO)? {
                    return Ok(SourceEvent::Data(bytes));
                }
                return Ok(SourceEvent::Exited(code));
            }
            return Ok(SourceEvent::Idle);
        }

        // Stdout is closed; give the child up to `timeout` to be reaped.
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.try_exit()? {
                return Ok(SourceEvent::Exited(code));
            }
            if Instant::now() >= deadline {
                return Ok(SourceEvent::Idle);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn stop(&mut self) -> Result<()> {
        SubprocessReader::stop(self).map(|_| ())
    }
}

impl Drop for SubprocessReader {
    fn drop(&mut self) {
        if self.child.is_some()
            && let Err(e) = SubprocessReader::stop(self)
        {
            log::warn!("failed to stop {}: {e}", self.program);
        }
    }
}

#[cfg(unix)]
fn set_nonblocking(stdout: &ChildStdout) -> io::Result<()> {
    let fd = stdout.as_raw_fd();
    // SAFETY: fd is owned by `stdout` and stays open for the duration of
    // both calls.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// `poll(2)` on one descriptor. `Ok(true)` when a read will not block
/// (data, EOF or error are all "readable").
#[cfg(unix)]
fn wait_readable(stdout: &ChildStdout, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: stdout.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // SAFETY: `pfd` is a valid pollfd for the duration of the call and the
    // count matches.
    let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(rc > 0 && pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
}

#[cfg(unix)]
fn terminate(child: &Child) {
    // SAFETY: kill with a pid we spawned and have not yet reaped.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> SubprocessReader {
        SubprocessReader::spawn("/bin/sh", &["-c", script], Duration::from_secs(2)).unwrap()
    }

    // -----------------------------------------------------------------------
    // Config
    // -----------------------------------------------------------------------

    #[test]
    fn default_args() {
        let args = ReaderConfig::default().args();
        assert_eq!(args, vec!["--samplers", "cpu_power,gpu_power,ane_power", "-i", "500"]);
    }

    #[test]
    fn poll_timeout_is_clamped_to_heartbeat() {
        let cfg = ReaderConfig {
            poll_timeout_ms: 5_000,
            ..Default::default()
        };
        assert_eq!(cfg.poll_timeout(), crate::shutdown::HEARTBEAT);
    }

    // -----------------------------------------------------------------------
    // Stall detection
    // -----------------------------------------------------------------------

    #[test]
    fn stall_reported_once_after_limit() {
        let mut d = StallDetector::new(Duration::from_millis(500));
        let t0 = d.last_data;
        assert_eq!(d.observe_idle_at(t0 + Duration::from_millis(100)), None);
        assert_eq!(d.observe_idle_at(t0 + Duration::from_millis(500)), None);
        assert_eq!(
            d.observe_idle_at(t0 + Duration::from_millis(600)),
            Some(Duration::from_millis(600))
        );
        assert!(d.is_stalled());
        assert_eq!(d.observe_idle_at(t0 + Duration::from_millis(900)), None);
        assert!(d.observe_data());
        assert!(!d.is_stalled());
        assert!(!d.observe_data());
    }

    #[test]
    fn many_idle_polls_between_slow_samples_are_not_a_stall() {
        let limit = StallDetector::limit_for(5, Duration::from_secs(1));
        assert_eq!(limit, Duration::from_secs(2));
        let mut d = StallDetector::new(limit);
        for _ in 0..5 {
            let t = d.last_data;
            for step in 1..=10 {
                assert_eq!(d.observe_idle_at(t + Duration::from_millis(100 * step)), None);
            }
            assert!(!d.observe_data());
        }
    }

    #[test]
    fn stall_limit_has_a_heartbeat_floor() {
        assert_eq!(
            StallDetector::limit_for(5, Duration::from_millis(10)),
            Duration::from_millis(500)
        );
        let cfg = ReaderConfig {
            interval_ms: 1000,
            ..Default::default()
        };
        assert_eq!(cfg.stall_limit(), Duration::from_secs(2));
    }

    // -----------------------------------------------------------------------
    // Subprocess
    // -----------------------------------------------------------------------

    #[test]
    fn missing_binary_is_reported_distinctly() {
        let err = SubprocessReader::spawn("/nonexistent/powermetrics", &[] as &[&str], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, PowerError::BinaryMissing { .. }));

        let cfg = ReaderConfig {
            program: "/nonexistent/powermetrics".into(),
            ..Default::default()
        };
        assert!(matches!(
            SubprocessReader::start(&cfg),
            Err(PowerError::BinaryMissing { .. })
        ));
    }

    #[test]
    fn poll_times_out_without_output() {
        let mut r = sh("sleep 5");
        let start = Instant::now();
        assert!(r.poll(Duration::from_millis(50)).unwrap().is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
        r.stop().unwrap();
    }

    #[test]
    fn reads_output_then_reports_exit() {
        let mut r = sh("printf 'ANE Power: 5 mW\\n'; exit 3");
        let mut got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let code = loop {
            match r.next_event(Duration::from_millis(100)).unwrap() {
                SourceEvent::Data(b) => got.extend(b),
                SourceEvent::Idle => {}
                SourceEvent::Exited(code) => break code,
            }
            assert!(Instant::now() < deadline, "child never exited");
        };
        assert_eq!(String::from_utf8(got).unwrap(), "ANE Power: 5 mW\n");
        assert_eq!(code, Some(3));
    }

    #[test]
    fn stop_terminates_long_running_child() {
        let mut r = sh("while true; do sleep 1; done");
        let start = Instant::now();
        let _ = r.stop().unwrap();
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(r.pid().is_none());
        // Second stop is a no-op.
        r.stop().unwrap();
    }

    #[test]
    fn failed_stop_still_kills_the_child() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "while true; do sleep 1; done"])
            .spawn()
            .unwrap();
        let err = stop_or_kill(&mut child, |_| Err(io::Error::other("wait failed"))).unwrap_err();
        assert_eq!(err.to_string(), "wait failed");
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn stop_kills_child_ignoring_sigterm() {
        let mut r = SubprocessReader::spawn(
            "/bin/sh",
            &["-c", "trap '' TERM; while true; do sleep 1; done"],
            Duration::from_millis(200),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let code = r.stop().unwrap();
        assert_eq!(code, None);
    }
}
