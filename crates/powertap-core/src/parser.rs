//! Incremental parser for `powermetrics`-style text output.
//!
//! Raw bytes go in, [`PowerSample`]s come out. The parser never blocks and
//! never grows without bound:
//!
//! - [`LineBuffer`] splits bytes into lines and caps the partial-line buffer
//!   at 16 KiB. On overflow without a terminator it keeps the last 8 KiB as
//!   overlap context and counts a truncation.
//! - Each line is offered to an ordered list of pure pattern functions
//!   ([`PATTERNS`]). The first one that recognises the line wins; lines no
//!   pattern recognises are dropped and counted.
//! - Readings accumulate into a block. A block closes on a
//!   `*** Sampled system activity` header, or, for streams without headers,
//!   when a rail that already has a reading in the open block shows up again.
//!
//! Output format drift across OS versions is handled by the pattern list:
//! `CPU Power: 812 mW`, `Combined Power (CPU + GPU + ANE): 1290 mW`,
//! `ANE: 12 mW`, `Intel energy model derived package power (CPUs+GT+SA): 1.63W`,
//! and finally a keyword + `mW` scan for anything else.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::sample::{PowerSample, Rail};

/// Hard ceiling on buffered partial-line bytes.
pub const MAX_BUFFER_BYTES: usize = 16 * 1024;
/// Bytes retained as overlap context when the ceiling is hit.
pub const OVERLAP_BYTES: usize = 8 * 1024;

const BLOCK_HEADER: &str = "*** Sampled system activity";

// ---------------------------------------------------------------------------
// Config & stats
// ---------------------------------------------------------------------------

/// Parser buffer limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub max_buffer_bytes: usize,
    pub overlap_bytes: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: MAX_BUFFER_BYTES,
            overlap_bytes: OVERLAP_BYTES,
        }
    }
}

/// Running counters, useful for session metadata and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserStats {
    pub lines_seen: u64,
    pub lines_matched: u64,
    pub lines_dropped: u64,
    pub samples_emitted: u64,
    pub samples_rejected: u64,
    pub truncations: u64,
}

// ---------------------------------------------------------------------------
// Line patterns
// ---------------------------------------------------------------------------

/// How confidently a pattern identified its line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// One of the known exact formats.
    Exact,
    /// The keyword scan. Only fills rails that are still empty.
    Scan,
}

/// One rail value recognised on one line. `value_mw` is `None` when the
/// line named the rail but its number was malformed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RailReading {
    pub rail: Rail,
    pub value_mw: Option<f64>,
    pub kind: MatchKind,
}

/// A pure line recogniser.
pub type LinePattern = fn(&str) -> Option<RailReading>;

/// Recognisers in the order they are tried.
pub const PATTERNS: &[(&str, LinePattern)] = &[
    ("combined_power", combined_power),
    ("package_power", package_power),
    ("rail_power", rail_power),
    ("rail_compact", rail_compact),
    ("keyword_scan", keyword_scan),
];

static COMBINED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*combined\s+power\b[^:]*:\s*(\S+?)\s*(mW|W)\s*$").expect("valid regex")
});
static PACKAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:intel energy model derived\s+)?package\s+power\b[^:]*:\s*(\S+?)\s*(mW|W)\s*$")
        .expect("valid regex")
});
static RAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(ANE|CPU|GPU)\s+power\s*:\s*(\S+?)\s*(mW|W)\s*$").expect("valid regex")
});
static COMPACT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(ANE|CPU|GPU|Package)\s*:\s*(\S+?)\s*(mW|W)\s*$").expect("valid regex")
});
static KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(combined|package|ane|cpu|gpu)\b").expect("valid regex")
});
static MW_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*mW\b").expect("valid regex")
});

/// Parse a numeric field, scaling watts to milliwatts. Malformed, negative
/// or non-finite text yields `None` (absent), never zero.
fn coerce_mw(raw: &str, unit: &str) -> Option<f64> {
    let v = raw.trim().parse::<f64>().ok()?;
    if !v.is_finite() || v < 0.0 {
        return None;
    }
    if unit.eq_ignore_ascii_case("w") {
        Some(v * 1000.0)
    } else {
        Some(v)
    }
}

fn rail_from_keyword(word: &str) -> Option<Rail> {
    match word.to_ascii_lowercase().as_str() {
        "ane" => Some(Rail::Ane),
        "cpu" => Some(Rail::Cpu),
        "gpu" => Some(Rail::Gpu),
        "package" | "combined" => Some(Rail::Package),
        _ => None,
    }
}

/// `Combined Power (CPU + GPU + ANE): 1290 mW`
pub fn combined_power(line: &str) -> Option<RailReading> {
    let caps = COMBINED_RE.captures(line)?;
    Some(RailReading {
        rail: Rail::Package,
        value_mw: coerce_mw(&caps[1], &caps[2]),
        kind: MatchKind::Exact,
    })
}

/// `Package Power: 4100 mW` and the Intel-era
/// `Intel energy model derived package power (CPUs+GT+SA): 1.63W`.
pub fn package_power(line: &str) -> Option<RailReading> {
    let caps = PACKAGE_RE.captures(line)?;
    Some(RailReading {
        rail: Rail::Package,
        value_mw: coerce_mw(&caps[1], &caps[2]),
        kind: MatchKind::Exact,
    })
}

/// `ANE Power: 1200.0 mW`, `CPU Power: 600 mW`, `GPU Power: 0.5 W`
pub fn rail_power(line: &str) -> Option<RailReading> {
    let caps = RAIL_RE.captures(line)?;
    Some(RailReading {
        rail: rail_from_keyword(&caps[1])?,
        value_mw: coerce_mw(&caps[2], &caps[3]),
        kind: MatchKind::Exact,
    })
}

/// `ANE: 12 mW`
pub fn rail_compact(line: &str) -> Option<RailReading> {
    let caps = COMPACT_RE.captures(line)?;
    Some(RailReading {
        rail: rail_from_keyword(&caps[1])?,
        value_mw: coerce_mw(&caps[2], &caps[3]),
        kind: MatchKind::Exact,
    })
}

/// Last resort: any line naming a rail keyword and carrying an `mW` value.
/// Package/combined keywords take priority over component keywords.
pub fn keyword_scan(line: &str) -> Option<RailReading> {
    let value = MW_VALUE_RE.captures(line)?;
    let mut rails = KEYWORD_RE
        .captures_iter(line)
        .filter_map(|c| rail_from_keyword(&c[1]));
    let first = rails.next()?;
    let rail = if first == Rail::Package || rails.any(|r| r == Rail::Package) {
        Rail::Package
    } else {
        first
    };
    Some(RailReading {
        rail,
        value_mw: coerce_mw(&value[1], "mW"),
        kind: MatchKind::Scan,
    })
}

/// Offer `line` to each pattern in order.
pub fn match_line(line: &str) -> Option<RailReading> {
    PATTERNS.iter().find_map(|(_, pattern)| pattern(line))
}

pub fn is_block_header(line: &str) -> bool {
    line.trim_start().starts_with(BLOCK_HEADER)
}

// ---------------------------------------------------------------------------
// LineBuffer
// ---------------------------------------------------------------------------

/// Splits a byte stream into lines with a bounded partial-line buffer.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max: usize,
    overlap: usize,
    truncations: u64,
}

impl LineBuffer {
    pub fn new(config: ParserConfig) -> Self {
        let max = config.max_buffer_bytes.max(1);
        let overlap = config.overlap_bytes.min(max);
        Self {
            buf: Vec::with_capacity(max.min(4096)),
            max,
            overlap,
            truncations: 0,
        }
    }

    /// Feed a chunk, appending every completed line to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<String>) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.append_bounded(&rest[..pos]);
            let line = String::from_utf8_lossy(&self.buf)
                .trim_end_matches('\r')
                .to_string();
            self.buf.clear();
            out.push(line);
            rest = &rest[pos + 1..];
        }
        self.append_bounded(rest);
    }

    /// Take whatever partial line is buffered (end of stream).
    pub fn take_partial(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).to_string();
        self.buf.clear();
        Some(line)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn truncations(&self) -> u64 {
        self.truncations
    }

    fn append_bounded(&mut self, bytes: &[u8]) {
        if self.buf.len() + bytes.len() <= self.max {
            self.buf.extend_from_slice(bytes);
            return;
        }

        self.truncations += 1;
        log::debug!(
            "line buffer overflow ({} bytes without terminator), keeping last {}",
            self.buf.len() + bytes.len(),
            self.overlap
        );
        if bytes.len() >= self.overlap {
            self.buf.clear();
            self.buf
                .extend_from_slice(&bytes[bytes.len() - self.overlap..]);
        } else {
            let keep_from_buf = self.overlap - bytes.len();
            let drop = self.buf.len().saturating_sub(keep_from_buf);
            self.buf.drain(..drop);
            self.buf.extend_from_slice(bytes);
        }
    }
}

// ---------------------------------------------------------------------------
// StreamParser
// ---------------------------------------------------------------------------

/// Turns a byte stream into complete power samples.
#[derive(Debug)]
pub struct StreamParser {
    lines: LineBuffer,
    pending: Option<PowerSample>,
    exact_seen: [bool; 4],
    saw_header: bool,
    stats: ParserStats,
    clock: fn() -> f64,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}

impl StreamParser {
    pub fn new(config: ParserConfig) -> Self {
        Self::with_clock(config, clock::monotonic_secs)
    }

    /// Use a custom timestamp source (tests, replays).
    pub fn with_clock(config: ParserConfig, clock: fn() -> f64) -> Self {
        Self {
            lines: LineBuffer::new(config),
            pending: None,
            exact_seen: [false; 4],
            saw_header: false,
            stats: ParserStats::default(),
            clock,
        }
    }

    /// Feed raw bytes, returning every sample completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<PowerSample> {
        let mut lines = Vec::new();
        self.lines.feed(chunk, &mut lines);
        self.stats.truncations = self.lines.truncations();

        let mut out = Vec::new();
        for line in &lines {
            self.process_line(line, &mut out);
        }
        out
    }

    /// End of stream: parse any unterminated line and close the open block.
    pub fn finish(&mut self) -> Vec<PowerSample> {
        let mut out = Vec::new();
        if let Some(line) = self.lines.take_partial() {
            self.process_line(&line, &mut out);
        }
        self.close_block(&mut out);
        out
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Bytes currently held in the partial-line buffer.
    pub fn buffered_bytes(&self) -> usize {
        self.lines.len()
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<PowerSample>) {
        if line.trim().is_empty() {
            return;
        }
        self.stats.lines_seen += 1;

        if is_block_header(line) {
            self.saw_header = true;
            self.close_block(out);
            return;
        }

        let Some(reading) = match_line(line) else {
            self.stats.lines_dropped += 1;
            log::trace!("dropped unrecognised line: {line}");
            return;
        };
        self.stats.lines_matched += 1;

        let idx = rail_index(reading.rail);
        match reading.kind {
            MatchKind::Exact => {
                if self.exact_seen[idx] {
                    if self.saw_header {
                        // Repeated rail inside a delimited block: first wins.
                        return;
                    }
                    self.close_block(out);
                }
                self.exact_seen[idx] = true;
                let now = (self.clock)();
                let sample = self.pending.get_or_insert_with(|| PowerSample::at(now));
                sample.set(reading.rail, reading.value_mw);
            }
            MatchKind::Scan => {
                if self.exact_seen[idx] {
                    return;
                }
                let now = (self.clock)();
                let sample = self.pending.get_or_insert_with(|| PowerSample::at(now));
                if sample.get(reading.rail).is_none() {
                    sample.set(reading.rail, reading.value_mw);
                }
            }
        }
    }

    fn close_block(&mut self, out: &mut Vec<PowerSample>) {
        self.exact_seen = [false; 4];
        let Some(sample) = self.pending.take() else {
            return;
        };
        match sample.validate() {
            Ok(()) => {
                self.stats.samples_emitted += 1;
                out.push(sample);
            }
            Err(reason) => {
                self.stats.samples_rejected += 1;
                log::debug!("discarding malformed sample: {reason}");
            }
        }
    }
}

fn rail_index(rail: Rail) -> usize {
    match rail {
        Rail::Ane => 0,
        Rail::Cpu => 1,
        Rail::Gpu => 2,
        Rail::Package => 3,
    }
}
