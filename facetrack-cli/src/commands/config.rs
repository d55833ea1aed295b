//! Configuration management CLI commands.
//!
//! Provides `config get`, `config set`, `config list`, `config path` and
//! `config init` for viewing and modifying the configuration file from the
//! command line.

use std::path::Path;

use clap::Subcommand;
use facetrack::config::{ConfigKey, SessionConfig};

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Get a configuration value
    Get {
        /// Configuration key in format section.key (e.g., control.dead_zone)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key in format section.key (e.g., control.dead_zone)
        key: String,

        /// Value to set
        value: String,
    },

    /// List all configuration settings
    List,

    /// Show the configuration file path
    Path,

    /// Write a configuration file with every default value
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run a config subcommand against the file at `path`.
pub fn run(command: ConfigCommands, path: &Path) -> Result<(), CliError> {
    match command {
        ConfigCommands::Get { key } => run_get(path, &key),
        ConfigCommands::Set { key, value } => run_set(path, &key, &value),
        ConfigCommands::List => run_list(path),
        ConfigCommands::Path => run_path(path),
        ConfigCommands::Init { force } => run_init(path, force),
    }
}

fn parse_key(key: &str) -> Result<ConfigKey, CliError> {
    key.parse().map_err(|_| {
        CliError::Config(format!(
            "Unknown configuration key '{}'. Use 'facetrack config list' to see available keys.",
            key
        ))
    })
}

/// Current value of `key`, defaults included.
fn lookup(path: &Path, key: &str) -> Result<String, CliError> {
    let config_key = parse_key(key)?;
    let config = SessionConfig::load_or_default(path)?;
    Ok(config_key.get(&config))
}

/// Update `key` in the file, rejecting values that make the whole
/// configuration invalid.
fn update(path: &Path, key: &str, value: &str) -> Result<ConfigKey, CliError> {
    let config_key = parse_key(key)?;
    let mut config = SessionConfig::load_or_default(path)?;
    config_key.set(&mut config, value)?;
    config.validate()?;
    config.save(path)?;
    Ok(config_key)
}

/// Get a configuration value.
fn run_get(path: &Path, key: &str) -> Result<(), CliError> {
    println!("{}", lookup(path, key)?);
    Ok(())
}

/// Set a configuration value.
fn run_set(path: &Path, key: &str, value: &str) -> Result<(), CliError> {
    let config_key = update(path, key, value)?;
    println!("Set {} = {}", config_key.name(), value);
    Ok(())
}

/// List all configuration settings.
fn run_list(path: &Path) -> Result<(), CliError> {
    let config = SessionConfig::load_or_default(path)?;

    println!("Configuration Settings");
    println!("======================");
    println!();

    let mut current_section = "";

    for key in ConfigKey::all() {
        let section = key.section();

        if section != current_section {
            if !current_section.is_empty() {
                println!();
            }
            println!("[{}]", section);
            current_section = section;
        }

        println!("  {} = {}", key.key_name(), key.get(&config));
    }

    Ok(())
}

/// Show the configuration file path.
fn run_path(path: &Path) -> Result<(), CliError> {
    println!("{}", path.display());
    Ok(())
}

/// Write the defaults to a new file.
fn run_init(path: &Path, force: bool) -> Result<(), CliError> {
    if path.exists() && !force {
        return Err(CliError::Config(format!(
            "{} already exists. Use --force to overwrite it.",
            path.display()
        )));
    }
    SessionConfig::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
