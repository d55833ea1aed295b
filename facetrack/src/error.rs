//! Error taxonomy for tracking sessions.
//!
//! Failures are split by how the session reacts to them:
//!
//! - [`InitError`]: a collaborator could not be acquired. Fatal, the session
//!   never reaches `Tracking`.
//! - Telemetry read failures ([`VehicleError`] from altitude/battery reads):
//!   transient, logged and treated as "no data this cycle".
//! - [`SessionError::ActuatorCommand`]: a command could not be delivered while
//!   airborne. Fatal, a forced landing is attempted before termination.
//! - A frame gap is not an error at all; the cycle is simply skipped.

use thiserror::Error;

use crate::config::ConfigError;
use crate::detect::DetectorError;
use crate::frame::FrameError;
use crate::supervisor::SupervisorError;
use crate::vehicle::VehicleError;

/// Errors raised while acquiring session resources.
#[derive(Debug, Error)]
pub enum InitError {
    /// The detector could not be loaded.
    #[error("failed to load detector: {0}")]
    Detector(#[source] DetectorError),

    /// The vehicle link could not be established.
    #[error("failed to connect to vehicle: {0}")]
    Connect(#[source] VehicleError),

    /// The frame source could not be opened.
    #[error("failed to open frame source: {0}")]
    FrameSource(#[source] FrameError),

    /// No frame arrived before the first-frame timeout.
    #[error("no frame received within {timeout_ms} ms")]
    FirstFrame { timeout_ms: u128 },

    /// Cancellation was requested before initialization completed.
    #[error("initialization cancelled")]
    Cancelled,
}

/// Errors that end a tracking session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The configuration was rejected before anything was acquired.
    #[error("invalid session configuration: {0}")]
    Config(#[from] ConfigError),

    /// Resources could not be acquired.
    #[error("initialization failed: {0}")]
    Initialization(#[from] InitError),

    /// A velocity/takeoff/land command failed while airborne.
    #[error("actuator command failed: {0}")]
    ActuatorCommand(#[source] VehicleError),

    /// The flight supervisor rejected a transition.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// The session thread could not be spawned.
    #[error("failed to spawn session thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// The session thread panicked.
    #[error("session thread panicked")]
    Panicked,
}

impl SessionError {
    /// Returns true when the session ended because it was cancelled during
    /// initialization rather than because something failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionError::Initialization(InitError::Cancelled))
    }
}
