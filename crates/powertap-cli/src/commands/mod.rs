pub mod analyze;
pub mod baseline;
pub mod monitor;
pub mod plan;
pub mod profiles;
pub mod sessions;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use powertap_core::thermal::{ProfileTable, builtin_profiles, load_profiles};
use powertap_core::{
    Anchors, LoadPattern, MockProfile, PowerError, PowertapConfig, Rail, ReaderConfig, SampleSource,
    SimulatedSource, SubprocessReader,
};

/// Print an error with its remediation hint and exit non-zero.
pub fn fail(err: &PowerError) -> ! {
    eprintln!("error: {err}");
    if let Some(hint) = err.remediation() {
        eprintln!("  hint: {hint}");
    }
    std::process::exit(1);
}

/// Load `--config`, or defaults when none was given.
pub fn load_config(path: Option<&str>) -> PowertapConfig {
    match path {
        Some(p) => PowertapConfig::load(Path::new(p)).unwrap_or_else(|e| fail(&e)),
        None => PowertapConfig::default(),
    }
}

/// The thermal profile table: `--profiles` when given, built-in otherwise.
pub fn load_profile_table(path: Option<&str>) -> ProfileTable {
    match path {
        Some(p) => load_profiles(Path::new(p)).unwrap_or_else(|e| fail(&e)),
        None => ProfileTable::new(builtin_profiles()),
    }
}

/// Either a simulated chip or the real `powermetrics` subprocess.
pub fn open_source(
    mock: Option<&str>,
    pattern: LoadPattern,
    reader: &ReaderConfig,
) -> Result<Box<dyn SampleSource>, PowerError> {
    match mock {
        Some(chip) => {
            let profile = MockProfile::for_chip(chip);
            let interval = Duration::from_millis(reader.interval_ms.max(1));
            Ok(Box::new(SimulatedSource::new(profile, pattern, interval)))
        }
        None => Ok(Box::new(SubprocessReader::start(reader)?)),
    }
}

/// Parse a simulated load pattern name.
pub fn parse_pattern(s: &str) -> LoadPattern {
    match s {
        "constant" => LoadPattern::Constant { level: 0.5 },
        "idle" => LoadPattern::Constant { level: 0.0 },
        "square" | "square_wave" => LoadPattern::SquareWave {
            half_period_ticks: 10,
        },
        "burst" => LoadPattern::default(),
        _ => {
            eprintln!("Unknown load pattern '{s}', using burst");
            LoadPattern::default()
        }
    }
}

pub fn parse_rail(s: &str) -> Rail {
    s.parse().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    })
}

/// Anchors are only meaningful as a pair.
pub fn anchors(low: Option<f64>, high: Option<f64>) -> Option<Anchors> {
    match (low, high) {
        (Some(l), Some(h)) => Some(Anchors::new(l, h)),
        (None, None) => None,
        _ => {
            eprintln!("Warning: --low and --high must be given together; ignoring anchors");
            None
        }
    }
}

/// Parse `key:value` tags.
pub fn parse_tags(tags: &[String]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for tag in tags {
        if let Some((k, v)) = tag.split_once(':') {
            map.insert(k.to_string(), v.to_string());
        } else {
            eprintln!("Warning: ignoring malformed tag '{tag}' (expected key:value)");
        }
    }
    map
}

/// Parse a duration string like "5m", "30s", "1h", "100ms".
pub fn parse_duration(s: &str) -> Duration {
    try_parse_duration(s).unwrap_or_else(|| {
        eprintln!("Invalid duration: {s}");
        std::process::exit(1);
    })
}

fn try_parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();

    let (numeric, multiplier) = if let Some(rest) = s.strip_suffix("ms") {
        (rest, 1.0)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1000.0)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60_000.0)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3_600_000.0)
    } else {
        // Assume seconds
        (s, 1000.0)
    };

    let value: f64 = numeric.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(Duration::from_millis((value * multiplier).round() as u64))
}

pub fn format_duration_ms(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else if ms < 3_600_000 {
        format!("{:.1}m", ms as f64 / 60_000.0)
    } else {
        format!("{:.1}h", ms as f64 / 3_600_000.0)
    }
}

pub fn format_mw(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |mw| format!("{mw:.0}"))
}
