//! CLI error type.

use std::fmt;

use facetrack::config::ConfigError;
use facetrack::error::SessionError;
use facetrack::logging::LoggingError;

/// Errors surfaced to the user by the CLI.
#[derive(Debug)]
pub enum CliError {
    /// Bad or unreadable configuration.
    Config(String),
    /// Logging could not be set up.
    Logging(LoggingError),
    /// The tracking session failed.
    Session(SessionError),
    /// The session did not shut down within its stop timeout.
    StopTimeout,
    /// Terminal I/O failed.
    Io(std::io::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Logging(e) => write!(f, "Failed to initialize logging: {}", e),
            CliError::Session(e) => write!(f, "Tracking session failed: {}", e),
            CliError::StopTimeout => {
                write!(f, "Tracking session did not stop in time; the vehicle may still be flying")
            }
            CliError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Logging(e) => Some(e),
            CliError::Session(e) => Some(e),
            CliError::Io(e) => Some(e),
            CliError::Config(_) | CliError::StopTimeout => None,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<LoggingError> for CliError {
    fn from(e: LoggingError) -> Self {
        CliError::Logging(e)
    }
}

impl From<SessionError> for CliError {
    fn from(e: SessionError) -> Self {
        CliError::Session(e)
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Io(e)
    }
}
