//! Vehicle (actuator and telemetry) abstraction.
//!
//! The tracking core never speaks a wire protocol itself. It drives the
//! vehicle through the [`Vehicle`] trait, which a transport crate implements
//! for real hardware and [`crate::sim::SimVehicle`] implements for tests and
//! dry runs.
//!
//! # Failure semantics
//!
//! Every call may fail. How the session reacts depends on the call:
//!
//! | Call                | Failure while...     | Reaction                          |
//! |---------------------|----------------------|-----------------------------------|
//! | `connect`           | initializing         | fatal, session terminates         |
//! | `set_velocity`      | airborne             | fatal, forced landing attempted   |
//! | `takeoff`           | grounded             | logged, vehicle stays grounded    |
//! | `land`              | any                  | fatal during normal flight        |
//! | `altitude_cm`       | any                  | transient, interlock skipped      |
//! | `battery_percent`   | any                  | transient, no battery data        |
//! | `disconnect`        | cleanup              | logged and ignored                |

use thiserror::Error;

use crate::control::VelocityCommand;

/// Errors reported by a vehicle link.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VehicleError {
    /// The link is not connected.
    #[error("vehicle not connected")]
    NotConnected,

    /// The vehicle did not answer in time.
    #[error("vehicle did not respond in time")]
    Timeout,

    /// The vehicle answered but refused the command.
    #[error("vehicle rejected command: {0}")]
    Rejected(String),

    /// Transport-level failure.
    #[error("link error: {0}")]
    Link(String),
}

/// Actuator and telemetry channel of the tracked vehicle.
///
/// Implementations are exclusively owned by one session for its lifetime.
/// Telemetry reads (`altitude_cm`, `battery_percent`) are expected to return
/// within a short bounded time; a slow link should time out and report
/// [`VehicleError::Timeout`] rather than block the control loop.
pub trait Vehicle: Send {
    /// Establish the link.
    fn connect(&mut self) -> Result<(), VehicleError>;

    /// Take off and hover.
    fn takeoff(&mut self) -> Result<(), VehicleError>;

    /// Land.
    fn land(&mut self) -> Result<(), VehicleError>;

    /// Send a 4-axis velocity command.
    fn set_velocity(&mut self, command: VelocityCommand) -> Result<(), VehicleError>;

    /// Current height above ground in centimetres.
    fn altitude_cm(&mut self) -> Result<i32, VehicleError>;

    /// Remaining battery in percent.
    fn battery_percent(&mut self) -> Result<u8, VehicleError>;

    /// Tear the link down. Must tolerate being called on a link that is
    /// already disconnected.
    fn disconnect(&mut self) -> Result<(), VehicleError>;
}

impl<V: Vehicle + ?Sized> Vehicle for Box<V> {
    fn connect(&mut self) -> Result<(), VehicleError> {
        (**self).connect()
    }

    fn takeoff(&mut self) -> Result<(), VehicleError> {
        (**self).takeoff()
    }

    fn land(&mut self) -> Result<(), VehicleError> {
        (**self).land()
    }

    fn set_velocity(&mut self, command: VelocityCommand) -> Result<(), VehicleError> {
        (**self).set_velocity(command)
    }

    fn altitude_cm(&mut self) -> Result<i32, VehicleError> {
        (**self).altitude_cm()
    }

    fn battery_percent(&mut self) -> Result<u8, VehicleError> {
        (**self).battery_percent()
    }

    fn disconnect(&mut self) -> Result<(), VehicleError> {
        (**self).disconnect()
    }
}
