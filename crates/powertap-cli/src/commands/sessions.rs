//! `powertap sessions`: list and inspect recorded sessions.

use std::path::{Path, PathBuf};

use powertap_core::session::{META_FILE, SAMPLES_FILE, SessionMeta, list_sessions, read_session_meta};

use super::format_duration_ms;

/// Run the sessions command.
pub fn run(session_path: Option<&str>, dir: &str) {
    if let Some(path) = session_path {
        let session_dir = PathBuf::from(path);
        if !session_dir.join(META_FILE).exists() {
            eprintln!("Not a session directory: {path}");
            eprintln!("Expected {META_FILE} in that directory.");
            std::process::exit(1);
        }
        match read_session_meta(&session_dir) {
            Ok(meta) => show_session(&session_dir, &meta),
            Err(e) => super::fail(&e),
        }
    } else {
        list(dir);
    }
}

fn list(dir: &str) {
    let sessions_dir = Path::new(dir);
    if !sessions_dir.exists() {
        println!("No sessions directory found at {dir}");
        println!("Record a session first: powertap monitor --mock M2");
        return;
    }

    let sessions = match list_sessions(sessions_dir) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to read {dir}: {e}");
            return;
        }
    };
    if sessions.is_empty() {
        println!("No sessions found in {dir}/");
        println!("Record a session first: powertap monitor --mock M2");
        return;
    }

    println!(
        "{:<44} {:<18} {:>8} {:>10} {:>9}",
        "Session", "Source", "Samples", "Duration", "ANE mean"
    );
    println!("{}", "-".repeat(93));

    for (path, meta) in &sessions {
        let dir_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let ane_mean = meta
            .analysis
            .as_ref()
            .and_then(|a| a.reports.get(&powertap_core::Rail::Ane))
            .map_or_else(|| "-".to_string(), |r| format!("{:.0}", r.mean_mw));

        println!(
            "{:<44} {:<18} {:>8} {:>10} {:>9}",
            truncate(&dir_name, 44),
            truncate(&meta.source, 18),
            meta.total_samples,
            format_duration_ms(meta.duration_ms),
            ane_mean,
        );
    }
}

fn show_session(dir: &Path, meta: &SessionMeta) {
    println!("Session {}", meta.id);
    println!("  Directory: {}", dir.display());
    println!("  Started:   {}", meta.started_at);
    println!("  Ended:     {}", meta.ended_at);
    println!("  Duration:  {}", format_duration_ms(meta.duration_ms));
    println!("  Source:    {}", meta.source);
    if let Some(chip) = &meta.chip {
        println!("  Chip:      {chip}");
    }
    println!("  Interval:  {}ms", meta.interval_ms);
    println!("  Samples:   {}", meta.total_samples);
    for (rail, n) in &meta.samples_per_rail {
        println!("    {:<8} {n}", rail.to_string());
    }
    if meta.dropped_samples > 0 {
        println!("  Dropped:   {} (recorder fell behind)", meta.dropped_samples);
    }
    if let Some(p) = &meta.parser {
        println!(
            "  Parser:    {} lines, {} unrecognised, {} rejected samples, {} truncations",
            p.lines_seen, p.lines_dropped, p.samples_rejected, p.truncations
        );
    }
    if !meta.tags.is_empty() {
        let mut tags: Vec<_> = meta.tags.iter().map(|(k, v)| format!("{k}:{v}")).collect();
        tags.sort();
        println!("  Tags:      {}", tags.join(", "));
    }
    if let Some(note) = &meta.note {
        println!("  Note:      {note}");
    }
    println!("  Machine:   {} / {} ({} cores)", meta.machine.os, meta.machine.arch, meta.machine.cores);

    if let Some(analysis) = &meta.analysis {
        println!();
        super::analyze::print_snapshot(analysis);
    }
    println!();
    println!(
        "Replay with: powertap analyze {}",
        dir.join(SAMPLES_FILE).display()
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max - 3).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("2026-10-19T101500Z-mock-m2-abcdef12", 12), "2026-10-1...");
    }
}
