//! Session recording.
//!
//! Each monitoring run is a directory containing:
//! - `samples.csv`: one row per sample,
//!   `timestamp,ane_mw,cpu_mw,gpu_mw,package_mw`, absent rails left empty
//! - `session.json`: metadata written when the session finishes
//!
//! Rows are flushed as they are written. [`SessionWriter::finish`] flushes
//! and `fsync`s both files; a failure there is reported as
//! [`PowerError::Persistence`].

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::AnalysisSnapshot;
use crate::error::{PowerError, Result};
use crate::parser::ParserStats;
use crate::sample::{PowerSample, Rail};

pub const SAMPLES_FILE: &str = "samples.csv";
pub const META_FILE: &str = "session.json";
pub const CSV_HEADER: &str = "timestamp,ane_mw,cpu_mw,gpu_mw,package_mw";

// ---------------------------------------------------------------------------
// Machine info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineInfo {
    pub os: String,
    pub arch: String,
    pub chip: String,
    pub cores: usize,
}

/// Best-effort description of the host.
pub fn detect_machine_info() -> MachineInfo {
    MachineInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        chip: detect_chip().unwrap_or_else(|| "unknown".to_string()),
        cores: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    }
}

/// CPU brand string, e.g. `"Apple M2 Pro"`.
pub fn detect_chip() -> Option<String> {
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("sysctl")
            .args(["-n", "machdep.cpu.brand_string"])
            .output()
            .ok()?;
        let s = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if s.is_empty() { None } else { Some(s) }
    }
    #[cfg(target_os = "linux")]
    {
        fs::read_to_string("/proc/cpuinfo").ok().and_then(|s| {
            s.lines()
                .find(|l| l.starts_with("model name"))
                .and_then(|l| l.split(':').nth(1))
                .map(|v| v.trim().to_string())
        })
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

// ---------------------------------------------------------------------------
// Metadata & config
// ---------------------------------------------------------------------------

/// Contents of `session.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub version: u32,
    pub id: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
    /// `powermetrics` or `mock:<chip>`.
    pub source: String,
    pub chip: Option<String>,
    pub interval_ms: u64,
    pub total_samples: u64,
    pub samples_per_rail: BTreeMap<Rail, u64>,
    #[serde(default)]
    pub parser: Option<ParserStats>,
    /// Samples the recorder missed because it fell behind the bus.
    #[serde(default)]
    pub dropped_samples: u64,
    #[serde(default)]
    pub analysis: Option<AnalysisSnapshot>,
    pub machine: MachineInfo,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub note: Option<String>,
    pub powertap_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub output_dir: PathBuf,
    pub source: String,
    pub chip: Option<String>,
    pub interval_ms: u64,
    pub tags: HashMap<String, String>,
    pub note: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("sessions"),
            source: crate::reader::POWERMETRICS.to_string(),
            chip: None,
            interval_ms: 500,
            tags: HashMap::new(),
            note: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append-only writer for one session directory.
pub struct SessionWriter {
    session_dir: PathBuf,
    csv_path: PathBuf,
    csv: BufWriter<File>,
    total_samples: u64,
    samples_per_rail: BTreeMap<Rail, u64>,
    parser: Option<ParserStats>,
    dropped_samples: u64,
    analysis: Option<AnalysisSnapshot>,
    started_at: SystemTime,
    started_instant: Instant,
    session_id: String,
    config: SessionConfig,
    machine: MachineInfo,
}

impl SessionWriter {
    /// Create the session directory and `samples.csv` with its header.
    pub fn new(config: SessionConfig) -> Result<Self> {
        let session_id = Uuid::new_v4().to_string();
        let started_at = SystemTime::now();
        let since_epoch = started_at.duration_since(UNIX_EPOCH).unwrap_or_default();
        let dir_name = format!(
            "{}-{}-{}",
            format_iso8601_compact(since_epoch),
            slug(&config.source),
            &session_id[..8]
        );
        let session_dir = config.output_dir.join(dir_name);
        fs::create_dir_all(&session_dir).map_err(|e| persistence(&session_dir, e))?;

        let csv_path = session_dir.join(SAMPLES_FILE);
        let file = File::create(&csv_path).map_err(|e| persistence(&csv_path, e))?;
        let mut csv = BufWriter::new(file);
        writeln!(csv, "{CSV_HEADER}")
            .and_then(|()| csv.flush())
            .map_err(|e| persistence(&csv_path, e))?;

        log::info!("recording session to {}", session_dir.display());
        Ok(Self {
            session_dir,
            csv_path,
            csv,
            total_samples: 0,
            samples_per_rail: BTreeMap::new(),
            parser: None,
            dropped_samples: 0,
            analysis: None,
            started_at,
            started_instant: Instant::now(),
            session_id,
            config,
            machine: detect_machine_info(),
        })
    }

    /// Append one row and flush it to the OS.
    pub fn write_sample(&mut self, sample: &PowerSample) -> Result<()> {
        writeln!(self.csv, "{}", format_row(sample))
            .and_then(|()| self.csv.flush())
            .map_err(|e| persistence(&self.csv_path, e))?;
        self.total_samples += 1;
        for rail in Rail::ALL {
            if sample.get(rail).is_some() {
                *self.samples_per_rail.entry(rail).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    pub fn set_parser_stats(&mut self, stats: ParserStats) {
        self.parser = Some(stats);
    }

    pub fn add_dropped(&mut self, n: u64) {
        self.dropped_samples += n;
    }

    pub fn set_analysis(&mut self, snapshot: AnalysisSnapshot) {
        self.analysis = Some(snapshot);
    }

    /// Flush and `fsync` the samples, then write and `fsync` `session.json`.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.csv
            .flush()
            .and_then(|()| self.csv.get_ref().sync_all())
            .map_err(|e| persistence(&self.csv_path, e))?;

        let ended_at = SystemTime::now();
        let meta = SessionMeta {
            version: 1,
            id: self.session_id,
            started_at: format_iso8601(self.started_at.duration_since(UNIX_EPOCH).unwrap_or_default()),
            ended_at: format_iso8601(ended_at.duration_since(UNIX_EPOCH).unwrap_or_default()),
            duration_ms: self.started_instant.elapsed().as_millis() as u64,
            source: self.config.source,
            chip: self.config.chip,
            interval_ms: self.config.interval_ms,
            total_samples: self.total_samples,
            samples_per_rail: self.samples_per_rail,
            parser: self.parser,
            dropped_samples: self.dropped_samples,
            analysis: self.analysis,
            machine: self.machine,
            tags: self.config.tags,
            note: self.config.note,
            powertap_version: crate::VERSION.to_string(),
        };

        let meta_path = self.session_dir.join(META_FILE);
        let json = serde_json::to_string_pretty(&meta).map_err(|e| persistence(&meta_path, io::Error::other(e)))?;
        File::create(&meta_path)
            .and_then(|mut f| {
                f.write_all(json.as_bytes())?;
                f.sync_all()
            })
            .map_err(|e| persistence(&meta_path, e))?;

        log::info!(
            "session {} finished: {} samples",
            self.session_dir.display(),
            meta.total_samples
        );
        Ok(self.session_dir)
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn elapsed(&self) -> Duration {
        self.started_instant.elapsed()
    }
}

fn persistence(path: &Path, source: io::Error) -> PowerError {
    PowerError::Persistence {
        path: path.to_path_buf(),
        source,
    }
}

// ---------------------------------------------------------------------------
// CSV rows
// ---------------------------------------------------------------------------

/// `Display` for `f64` prints the shortest string that parses back to the
/// same value, so rows round-trip exactly.
pub fn format_row(sample: &PowerSample) -> String {
    let cell = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_default();
    format!(
        "{},{},{},{},{}",
        sample.timestamp,
        cell(sample.ane_mw),
        cell(sample.cpu_mw),
        cell(sample.gpu_mw),
        cell(sample.package_mw)
    )
}

fn invalid(line_no: usize, msg: impl std::fmt::Display) -> PowerError {
    PowerError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("line {line_no}: {msg}"),
    ))
}

fn parse_cell(raw: &str, line_no: usize) -> Result<Option<f64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .map_err(|e| invalid(line_no, format!("bad value '{raw}': {e}")))
}

/// Parse one data row.
pub fn parse_row(line: &str, line_no: usize) -> Result<PowerSample> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 5 {
        return Err(invalid(line_no, format!("expected 5 fields, got {}", fields.len())));
    }
    let timestamp = parse_cell(fields[0], line_no)?.ok_or_else(|| invalid(line_no, "missing timestamp"))?;
    Ok(PowerSample {
        timestamp,
        ane_mw: parse_cell(fields[1], line_no)?,
        cpu_mw: parse_cell(fields[2], line_no)?,
        gpu_mw: parse_cell(fields[3], line_no)?,
        package_mw: parse_cell(fields[4], line_no)?,
    })
}

/// Read every sample from a `samples.csv` (or a session directory holding
/// one). A final line without a terminator is an interrupted write and is
/// skipped.
pub fn read_samples_csv(path: &Path) -> Result<Vec<PowerSample>> {
    let path = if path.is_dir() {
        path.join(SAMPLES_FILE)
    } else {
        path.to_path_buf()
    };
    let contents = fs::read_to_string(&path)?;
    let complete = match contents.rfind('\n') {
        Some(end) => &contents[..=end],
        None => "",
    };
    if complete.len() < contents.len() {
        log::warn!("{}: ignoring unterminated final row", path.display());
    }

    let mut lines = complete.lines().enumerate();
    match lines.next() {
        Some((_, header)) if header.trim() == CSV_HEADER => {}
        Some((_, header)) => return Err(invalid(1, format!("unexpected header '{header}'"))),
        None => return Ok(Vec::new()),
    }
    lines
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| parse_row(l, i + 1))
        .collect()
}

/// Every readable session under `dir`, newest first.
pub fn list_sessions(dir: &Path) -> Result<Vec<(PathBuf, SessionMeta)>> {
    let mut sessions = Vec::new();
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let json_path = path.join(META_FILE);
        if !json_path.is_file() {
            continue;
        }
        match read_session_meta(&path) {
            Ok(meta) => sessions.push((path, meta)),
            Err(e) => log::debug!("skipping {}: {e}", path.display()),
        }
    }
    sessions.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));
    Ok(sessions)
}

pub fn read_session_meta(session_dir: &Path) -> Result<SessionMeta> {
    let path = session_dir.join(META_FILE);
    let contents = fs::read_to_string(&path)?;
    serde_json::from_str(&contents).map_err(|e| {
        PowerError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: {e}", path.display()),
        ))
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn slug(s: &str) -> String {
    let mapped: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let parts: Vec<&str> = mapped.split('-').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        "session".to_string()
    } else {
        parts.join("-")
    }
}

/// `2026-02-15T013000Z`, for directory names.
fn format_iso8601_compact(since_epoch: Duration) -> String {
    let (y, mo, d, h, mi, s) = utc_parts(since_epoch.as_secs());
    format!("{y:04}-{mo:02}-{d:02}T{h:02}{mi:02}{s:02}Z")
}

/// `2026-02-15T01:30:00Z`
fn format_iso8601(since_epoch: Duration) -> String {
    let (y, mo, d, h, mi, s) = utc_parts(since_epoch.as_secs());
    format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}Z")
}

/// UTC calendar fields from Unix seconds (days-from-civil inverse).
fn utc_parts(secs: u64) -> (i64, u32, u32, u32, u32, u32) {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (h, mi, s) = ((rem / 3600) as u32, ((rem / 60) % 60) as u32, (rem % 60) as u32);

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let mo = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = yoe + era * 400 + i64::from(mo <= 2);
    (y, mo, d, h, mi, s)
}
