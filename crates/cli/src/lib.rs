pub mod commands;
pub mod scenario;

use clap::{Parser, Subcommand};
use signoff_core::config::{AppConfig, LoadOptions, LogFormat};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "signoff",
    about = "Signoff approval workflow operator CLI",
    long_about = "Inspect configuration, check scenario fixtures, replay scripted approval scenarios, and run the escalation sweeper.",
    after_help = "Examples:\n  signoff doctor --json --scenario scenarios/it-leave-request.toml\n  signoff simulate scenarios/it-leave-request.toml\n  signoff run scenarios/it-leave-request.toml < commands.ndjson"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config and scenario fixtures and return structured status output")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
        #[arg(long = "scenario", value_name = "PATH", help = "Scenario file to load and check")]
        scenarios: Vec<PathBuf>,
    },
    #[command(about = "Replay a scenario file on a virtual clock and report every step")]
    Simulate {
        #[arg(value_name = "SCENARIO")]
        path: PathBuf,
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(
        about = "Load scenario fixtures, start the escalation sweeper, and read NDJSON commands from stdin"
    )]
    Run {
        #[arg(value_name = "SCENARIO")]
        path: PathBuf,
    },
}

/// Installs the global subscriber. Output goes to stderr so command output
/// on stdout stays machine-readable.
pub fn init_logging(config: &AppConfig) {
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    // A subscriber may already be installed when embedded in tests.
    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    if matches!(cli.command, Command::Simulate { .. } | Command::Run { .. }) {
        if let Ok(config) = AppConfig::load(LoadOptions::default()) {
            init_logging(&config);
        }
    }

    let result = match cli.command {
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json, scenarios } => commands::doctor::run(json, &scenarios),
        Command::Simulate { path, json } => commands::simulate::run(&path, json),
        Command::Run { path } => commands::run::run(&path),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
