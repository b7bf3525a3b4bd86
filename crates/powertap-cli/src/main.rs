//! CLI for powertap: watch the Neural Engine draw power while your model runs.

mod commands;

use clap::{Parser, Subcommand};
use powertap_core::CorePlacement;

#[derive(Parser)]
#[command(name = "powertap")]
#[command(about = "powertap: watch the Neural Engine draw power while your model runs")]
#[command(version = powertap_core::VERSION)]
struct Cli {
    /// More log output (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// JSON config file; command-line flags override its values
    #[arg(long, global = true)]
    config: Option<String>,

    /// JSON array of thermal profiles replacing the built-in table
    #[arg(long, global = true)]
    profiles: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample power rails while a synthetic inference workload runs.
    /// Needs root for the real powermetrics source; --mock needs nothing.
    Monitor {
        /// How long to run (e.g. "30s", "5m")
        #[arg(long, default_value = "30s")]
        duration: String,

        /// Sampling interval (e.g. "500ms"); default from config
        #[arg(long)]
        interval: Option<String>,

        /// Simulate this chip (M1, M2, M3, M4) instead of running powermetrics
        #[arg(long)]
        mock: Option<String>,

        /// Simulated load shape
        #[arg(long, default_value = "burst", value_parser = ["burst", "constant", "square", "idle"])]
        pattern: String,

        /// Forward ANE power to a serial display: "auto" or a device path
        #[arg(long)]
        serial: Option<String>,

        /// Output directory (default: ./sessions/)
        #[arg(long)]
        output: Option<String>,

        /// Do not write a session to disk
        #[arg(long)]
        no_record: bool,

        /// Rail the --low/--high anchors apply to
        #[arg(long, default_value = "ane")]
        rail: String,

        /// Idle anchor in mW for the burst-fraction estimate
        #[arg(long)]
        low: Option<f64>,

        /// Peak anchor in mW for the burst-fraction estimate
        #[arg(long)]
        high: Option<f64>,

        /// Busy time per synthetic inference (e.g. "20ms"); at most 100ms so
        /// Ctrl-C is noticed promptly
        #[arg(long, default_value = "20ms")]
        work: String,

        /// Metadata tags as key:value pairs
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Session note
        #[arg(long)]
        note: Option<String>,
    },

    /// Replay a recorded samples.csv (or session directory) through the analyzer
    Analyze {
        /// Path to samples.csv or a session directory
        path: String,

        /// Rail the --low/--high anchors apply to
        #[arg(long, default_value = "ane")]
        rail: String,

        /// Idle anchor in mW
        #[arg(long)]
        low: Option<f64>,

        /// Peak anchor in mW
        #[arg(long)]
        high: Option<f64>,

        /// Analyze only the last N samples
        #[arg(long)]
        window: Option<usize>,

        /// Write the analysis as JSON
        #[arg(long)]
        output: Option<String>,
    },

    /// Measure the idle baseline and judge whether elevated power is real work
    Baseline {
        /// Simulate this chip instead of running powermetrics
        #[arg(long)]
        mock: Option<String>,

        /// Simulated load shape
        #[arg(long, default_value = "idle", value_parser = ["burst", "constant", "square", "idle"])]
        pattern: String,

        /// Where the suspect background task was seen running
        #[arg(long, default_value = "unknown", value_parser = ["unknown", "efficiency", "performance"])]
        placement: String,

        /// Give up waiting for a stable baseline after this long (e.g. "60s")
        #[arg(long)]
        ceiling: Option<String>,

        /// Sampling interval (e.g. "500ms")
        #[arg(long)]
        interval: Option<String>,

        /// Print the assessment as JSON
        #[arg(long)]
        json: bool,
    },

    /// Recommend continuous or pulsed execution for a task length
    Plan {
        /// Chip identifier (default: detect)
        #[arg(long)]
        chip: Option<String>,

        /// Task length in milliseconds
        #[arg(long)]
        task_ms: u64,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// List thermal profiles
    Profiles,

    /// List and inspect recorded sessions
    Sessions {
        /// Path to a specific session directory to inspect
        session: Option<String>,

        /// Directory containing session recordings (default: ./sessions/)
        #[arg(long, default_value = "sessions")]
        dir: String,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn parse_placement(s: &str) -> CorePlacement {
    match s {
        "efficiency" => CorePlacement::Efficiency,
        "performance" => CorePlacement::Performance,
        _ => CorePlacement::Unknown,
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.as_deref();
    let profiles = cli.profiles.as_deref();

    match cli.command {
        Commands::Monitor {
            duration,
            interval,
            mock,
            pattern,
            serial,
            output,
            no_record,
            rail,
            low,
            high,
            work,
            tags,
            note,
        } => commands::monitor::run(commands::monitor::MonitorCommandConfig {
            config: commands::load_config(config_path),
            duration: commands::parse_duration(&duration),
            interval: interval.as_deref().map(commands::parse_duration),
            mock: mock.as_deref(),
            pattern: &pattern,
            serial: serial.as_deref(),
            output: output.as_deref(),
            no_record,
            rail: commands::parse_rail(&rail),
            low,
            high,
            work: commands::parse_duration(&work),
            tags: &tags,
            note: note.as_deref(),
        }),
        Commands::Analyze {
            path,
            rail,
            low,
            high,
            window,
            output,
        } => commands::analyze::run(commands::analyze::AnalyzeCommandConfig {
            path: &path,
            config: commands::load_config(config_path),
            rail: commands::parse_rail(&rail),
            low,
            high,
            window,
            output: output.as_deref(),
        }),
        Commands::Baseline {
            mock,
            pattern,
            placement,
            ceiling,
            interval,
            json,
        } => commands::baseline::run(commands::baseline::BaselineCommandConfig {
            config: commands::load_config(config_path),
            mock: mock.as_deref(),
            pattern: &pattern,
            placement: parse_placement(&placement),
            ceiling: ceiling.as_deref().map(commands::parse_duration),
            interval: interval.as_deref().map(commands::parse_duration),
            json,
        }),
        Commands::Plan {
            chip,
            task_ms,
            json,
        } => commands::plan::run(chip.as_deref(), task_ms, profiles, json),
        Commands::Profiles => commands::profiles::run(profiles),
        Commands::Sessions { session, dir } => commands::sessions::run(session.as_deref(), &dir),
    }
}
