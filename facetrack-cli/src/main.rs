//! Facetrack CLI - Command-line interface
//!
//! Runs tracking sessions against the simulator and manages the
//! configuration file.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use facetrack::config::config_file_path;
use facetrack::logging::{self, LogOptions};

use commands::config::ConfigCommands;
use commands::track::TrackArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "facetrack", version = facetrack::VERSION, about = "Keep a face centred in a flying camera's frame")]
struct Cli {
    /// Configuration file (defaults to the per-user config.ini)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a tracking session against the simulator
    Track(TrackArgs),

    /// View and edit configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match logging::init(&LogOptions {
        verbose: cli.verbose,
        log_dir: cli.log_dir.clone(),
    }) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {}", CliError::from(e));
            return ExitCode::FAILURE;
        }
    };

    let config_path = cli.config.unwrap_or_else(config_file_path);

    let result = match cli.command {
        Commands::Track(args) => commands::track::run(args, &config_path),
        Commands::Config { command } => commands::config::run(command, &config_path),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
