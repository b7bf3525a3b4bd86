//! `powertap plan`: continuous vs. pulsed execution for a task length.

use powertap_core::session::detect_chip;
use powertap_core::thermal::burst_count;
use powertap_core::{ExecutionPattern, recommend_execution};

/// Run the plan command.
pub fn run(chip: Option<&str>, task_ms: u64, profiles: Option<&str>, json: bool) {
    let table = super::load_profile_table(profiles);
    let chip = chip.map(str::to_string).or_else(detect_chip).unwrap_or_else(|| {
        eprintln!("Warning: could not detect the chip; pass --chip. Using conservative limits.");
        "unknown".to_string()
    });
    let profile = table.lookup(&chip);
    let pattern = recommend_execution(task_ms, &profile);
    let bursts = burst_count(task_ms, pattern);

    if json {
        let out = serde_json::json!({
            "chip": chip,
            "profile": profile,
            "task_ms": task_ms,
            "recommendation": pattern,
            "bursts": bursts,
        });
        match serde_json::to_string_pretty(&out) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("Error serializing plan: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    println!("Thermal plan");
    println!("  Chip:        {chip} (profile: {})", profile.chip);
    println!(
        "  Heat build:  {} ms   dissipate: {} ms   cooling at {:.0}%",
        profile.heat_build_ms, profile.heat_dissipate_ms, profile.cooling_threshold_pct
    );
    println!("  Task:        {task_ms} ms");
    println!();
    match pattern {
        ExecutionPattern::Continuous => {
            println!(
                "  Run continuously: the task is shorter than half the dissipation time ({} ms).",
                profile.continuous_threshold_ms()
            );
        }
        ExecutionPattern::Pulsed {
            burst_ms,
            cooldown_ms,
        } => {
            println!("  Run pulsed: {burst_ms} ms bursts, {cooldown_ms} ms cooldown between them.");
            println!(
                "  {bursts} bursts, about {} ms wall time including cooldowns.",
                task_ms + bursts.saturating_sub(1) * cooldown_ms
            );
        }
    }
}
