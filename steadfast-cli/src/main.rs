//! Steadfast CLI - operator interface to the dispatch engine.
//!
//! - `steadfast simulate`: run a seeded synthetic workload and print telemetry
//! - `steadfast config show|init|path`: inspect or create the INI config

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::style;
use steadfast::logging::{init_logging, LoggingGuard};
use steadfast::ConfigFile;

use commands::config::ConfigCommands;
use commands::simulate::SimulateArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "steadfast", version, about = "Resilient adaptive dispatch engine")]
struct Cli {
    /// Configuration file (default: <config dir>/steadfast/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter directive, overriding the config file (e.g. debug)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Drive a synthetic workload through an engine and print telemetry
    Simulate(SimulateArgs),

    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let path = match cli.config {
        Some(path) => path,
        None => ConfigFile::default_path().ok_or_else(|| {
            CliError::Config("No platform config directory; pass --config".to_string())
        })?,
    };

    match cli.command {
        Commands::Config { command } => {
            // `config init` must work even when the existing file is broken.
            let config = match &command {
                ConfigCommands::Init { .. } | ConfigCommands::Path => ConfigFile::default(),
                ConfigCommands::Show => ConfigFile::load_or_default(&path)?,
            };
            commands::config::run(command, &path, &config)
        }
        Commands::Simulate(args) => {
            let config = ConfigFile::load_or_default(&path)?;
            let _guard = start_logging(&config, cli.log_level)?;
            commands::simulate::run(args, config.engine)
        }
    }
}

fn start_logging(config: &ConfigFile, level: Option<String>) -> Result<LoggingGuard, CliError> {
    let mut logging = config.logging.clone();
    if let Some(level) = level {
        logging.level = level;
    }
    let guard = init_logging(&logging)?;
    tracing::info!(version = steadfast::VERSION, "steadfast starting");
    Ok(guard)
}
