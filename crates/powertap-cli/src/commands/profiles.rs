//! `powertap profiles`: list the thermal profile table.

use powertap_core::session::detect_chip;

/// Run the profiles command.
pub fn run(profiles: Option<&str>) {
    let table = super::load_profile_table(profiles);
    let detected = detect_chip();
    let current = detected.as_deref().and_then(|c| table.find(c)).map(|p| p.chip.clone());

    println!(
        "{:<12} {:>10} {:>14} {:>10} {:>16}",
        "Chip", "Build ms", "Dissipate ms", "Cooling %", "Continuous < ms"
    );
    println!("{}", "-".repeat(66));
    for p in table.profiles() {
        let marker = if current.as_deref() == Some(p.chip.as_str()) {
            "  <- this machine"
        } else {
            ""
        };
        println!(
            "{:<12} {:>10} {:>14} {:>10.0} {:>16}{}",
            p.chip,
            p.heat_build_ms,
            p.heat_dissipate_ms,
            p.cooling_threshold_pct,
            p.continuous_threshold_ms(),
            marker
        );
    }

    match (detected, current) {
        (Some(chip), None) => {
            let fallback = table.conservative(&chip);
            println!();
            println!(
                "{chip} has no profile; planning would use conservative limits ({} ms build, {} ms dissipate).",
                fallback.heat_build_ms, fallback.heat_dissipate_ms
            );
        }
        (None, _) => {
            println!();
            println!("Could not detect this machine's chip.");
        }
        _ => {}
    }
}
