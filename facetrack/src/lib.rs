//! Facetrack - keep a face centred in a flying camera's frame.
//!
//! This library provides the real-time tracking core: frame acquisition with
//! deduplication, the feedback control law, command throttling and the flight
//! supervisor that coordinates takeoff, landing, emergency stop and shutdown
//! across threads.
//!
//! # Architecture
//!
//! ```text
//! FrameSource ─► Detector ─► ControlLaw ─► FlightSupervisor ─► CommandThrottle ─► Vehicle
//!                                │              (interlocks)
//!                                └──────────────► TelemetrySink (non-blocking)
//! ```
//!
//! The detector, the vehicle link and the display are external collaborators
//! expressed as traits ([`detect::Detector`], [`vehicle::Vehicle`],
//! [`telemetry::TelemetrySink`]). The [`sim`] module provides closed-loop
//! stand-ins for all of them.

pub mod config;
pub mod control;
pub mod detect;
pub mod error;
pub mod frame;
pub mod logging;
pub mod session;
pub mod sim;
pub mod supervisor;
pub mod telemetry;
pub mod throttle;
pub mod vehicle;

/// Crate version, as reported by the CLI banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
