//! Tracing subscriber installation.
//!
//! Console output goes to stderr so that stdout stays free for telemetry
//! (`facetrack track --json`). When a log directory is given, a daily-rolling
//! file is written as well through a non-blocking appender; keep the returned
//! [`LoggingGuard`] alive until exit so buffered lines are flushed.
//!
//! `RUST_LOG` overrides the default filter.

use std::path::PathBuf;

use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::UtcOffset;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// File name prefix of rolled log files.
pub const LOG_FILE_PREFIX: &str = "facetrack.log";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// How logging should be set up.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Enable debug output for this crate.
    pub verbose: bool,

    /// Also write logs to a daily-rolling file in this directory.
    pub log_dir: Option<PathBuf>,
}

/// Keeps the file appender's worker alive.
#[must_use = "dropping the guard stops the file log writer"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Filter used when `RUST_LOG` is not set.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "info,facetrack=debug,facetrack_cli=debug"
    } else {
        "info"
    }
}

/// Install the global subscriber.
pub fn init(options: &LogOptions) -> Result<LoggingGuard, LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(options.verbose)));

    // The local offset cannot always be determined (e.g. multi-threaded on
    // some platforms); fall back to UTC.
    let timer = OffsetTime::local_rfc_3339().unwrap_or_else(|_| OffsetTime::new(UtcOffset::UTC, Rfc3339));

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(timer.clone())
        .with_target(false);

    let (file_layer, file_guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::LogDir {
                path: dir.clone(),
                source,
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_timer(timer)
                .with_ansi(false)
                .with_thread_names(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    if let Some(dir) = &options.log_dir {
        tracing::debug!(dir = %dir.display(), "File logging enabled");
    }

    Ok(LoggingGuard { _file: file_guard })
}
