//! Flight supervisor: session lifecycle and safety interlocks.
//!
//! # State machine
//!
//! ```text
//!   Idle ──► Initializing ──► Tracking ──► Landing ──► Terminated
//!    │            │              │  ▲                      ▲
//!    │            │              │  └─ takeoff / land      │
//!    └────────────┴──────────────┴──────── fatal / stop ───┘
//! ```
//!
//! `Tracking` has an `airborne` sub-state toggled by takeoff and landing.
//! Right after takeoff a short motion hold keeps velocity commands at zero
//! while the vehicle settles.
//!
//! The supervisor is owned by the session thread. Other threads observe it
//! through [`SharedFlightState`], a set of atomics updated on every
//! transition.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::SafetyConfig;
use crate::control::{FrameCenter, VelocityCommand};
use crate::vehicle::VehicleError;

/// Lifecycle state of a tracking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FlightState {
    #[default]
    Idle = 0,
    Initializing = 1,
    Tracking = 2,
    Landing = 3,
    Terminated = 4,
}

impl FlightState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FlightState::Idle,
            1 => FlightState::Initializing,
            2 => FlightState::Tracking,
            3 => FlightState::Landing,
            _ => FlightState::Terminated,
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: FlightState) -> bool {
        use FlightState::*;
        matches!(
            (self, next),
            (Idle, Initializing)
                | (Initializing, Tracking)
                | (Tracking, Landing)
                | (Idle | Initializing | Tracking | Landing, Terminated)
        )
    }

    /// Whether the session has ended.
    pub fn is_terminal(self) -> bool {
        self == FlightState::Terminated
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlightState::Idle => "idle",
            FlightState::Initializing => "initializing",
            FlightState::Tracking => "tracking",
            FlightState::Landing => "landing",
            FlightState::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for FlightState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the supervisor.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("invalid flight state transition: {from} -> {to}")]
    InvalidTransition { from: FlightState, to: FlightState },
}

/// Read-only view of the supervisor for other threads.
#[derive(Debug, Clone, Default)]
pub struct SharedFlightState {
    state: Arc<AtomicU8>,
    airborne: Arc<AtomicBool>,
    emergency: Arc<AtomicBool>,
}

impl SharedFlightState {
    /// Current lifecycle state.
    pub fn get(&self) -> FlightState {
        FlightState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the vehicle is currently flying.
    pub fn is_airborne(&self) -> bool {
        self.airborne.load(Ordering::Acquire)
    }

    /// Whether an emergency stop has been requested.
    pub fn emergency_requested(&self) -> bool {
        self.emergency.load(Ordering::Acquire)
    }

    /// Flag an emergency from any thread. The session loop picks it up on
    /// its next check, even mid-cycle.
    pub(crate) fn raise_emergency(&self) {
        self.emergency.store(true, Ordering::Release);
    }

    fn publish(&self, state: FlightState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn publish_airborne(&self, airborne: bool) {
        self.airborne.store(airborne, Ordering::Release);
    }
}

/// What to do when the target has been missing for a while.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LostTargetPolicy {
    /// Keep hovering in place until the target returns.
    #[default]
    Hover,
    /// Land once this many consecutive processed frames had no detection.
    Land { after_frames: u32 },
}

impl std::fmt::Display for LostTargetPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LostTargetPolicy::Hover => write!(f, "hover"),
            LostTargetPolicy::Land { after_frames } => write!(f, "land:{}", after_frames),
        }
    }
}

impl std::str::FromStr for LostTargetPolicy {
    type Err = String;

    /// Parses `hover` or `land:<frames>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "hover" {
            return Ok(LostTargetPolicy::Hover);
        }
        match s.strip_prefix("land:").map(|n| n.trim().parse::<u32>()) {
            Some(Ok(after_frames)) if after_frames > 0 => Ok(LostTargetPolicy::Land { after_frames }),
            _ => Err(format!("expected 'hover' or 'land:<frames>', got '{}'", s)),
        }
    }
}

/// Why the supervisor asked for a landing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandReason {
    TargetLost { frames: u32 },
    CriticalBattery { percent: u8 },
}

impl std::fmt::Display for LandReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LandReason::TargetLost { frames } => write!(f, "target lost for {} frames", frames),
            LandReason::CriticalBattery { percent } => write!(f, "battery critical at {}%", percent),
        }
    }
}

/// Outcome of a safety check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyAction {
    Continue,
    Land(LandReason),
}

/// Owns the lifecycle state and enforces the flight interlocks.
#[derive(Debug)]
pub struct FlightSupervisor {
    state: FlightState,
    shared: SharedFlightState,
    airborne: bool,
    motion_hold_until: Option<Instant>,
    center: Option<FrameCenter>,
    emergency: bool,
    low_battery_percent: u8,
    critical_battery_percent: u8,
    lost_target: LostTargetPolicy,
    low_battery_warned: bool,
}

impl FlightSupervisor {
    /// Create a supervisor in `Idle`.
    pub fn new(safety: &SafetyConfig) -> Self {
        Self::with_shared(safety, SharedFlightState::default())
    }

    /// Create a supervisor publishing into an existing shared view.
    pub fn with_shared(safety: &SafetyConfig, shared: SharedFlightState) -> Self {
        shared.publish(FlightState::Idle);
        shared.publish_airborne(false);
        Self {
            state: FlightState::Idle,
            shared,
            airborne: false,
            motion_hold_until: None,
            center: None,
            emergency: false,
            low_battery_percent: safety.low_battery_percent,
            critical_battery_percent: safety.critical_battery_percent,
            lost_target: safety.lost_target,
            low_battery_warned: false,
        }
    }

    /// A clonable read-only view for other threads.
    pub fn shared(&self) -> SharedFlightState {
        self.shared.clone()
    }

    pub fn state(&self) -> FlightState {
        self.state
    }

    pub fn is_airborne(&self) -> bool {
        self.airborne
    }

    /// The setpoint origin captured when tracking began.
    pub fn center(&self) -> Option<FrameCenter> {
        self.center
    }

    /// Whether an emergency has been requested, locally or from another
    /// thread.
    pub fn emergency_requested(&self) -> bool {
        self.emergency || self.shared.emergency_requested()
    }

    fn transition(&mut self, to: FlightState) -> Result<(), SupervisorError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(SupervisorError::InvalidTransition { from, to });
        }
        self.state = to;
        self.shared.publish(to);
        tracing::info!(from = %from, to = %to, airborne = self.airborne, "Flight state transition");
        Ok(())
    }

    /// Re-derive the setpoint from the current frame. Returns `true` if the
    /// frame dimensions changed.
    pub fn update_center(&mut self, center: FrameCenter) -> bool {
        if self.center == Some(center) {
            return false;
        }
        if let Some(previous) = self.center {
            tracing::info!(
                from_x = previous.x,
                from_y = previous.y,
                to_x = center.x,
                to_y = center.y,
                "Frame dimensions changed, setpoint moved"
            );
        }
        self.center = Some(center);
        true
    }

    /// Idle -> Initializing.
    pub fn begin_initialization(&mut self) -> Result<(), SupervisorError> {
        self.transition(FlightState::Initializing)
    }

    /// Initializing -> Tracking, fixing the setpoint to `center`.
    pub fn begin_tracking(&mut self, center: FrameCenter) -> Result<(), SupervisorError> {
        self.transition(FlightState::Tracking)?;
        self.center = Some(center);
        Ok(())
    }

    /// Tracking -> Landing with the emergency flag raised.
    pub fn request_emergency(&mut self) -> Result<(), SupervisorError> {
        if self.state != FlightState::Tracking {
            return Err(SupervisorError::InvalidTransition {
                from: self.state,
                to: FlightState::Landing,
            });
        }
        self.emergency = true;
        self.shared.raise_emergency();
        tracing::warn!(airborne = self.airborne, "Emergency stop requested");
        self.transition(FlightState::Landing)
    }

    /// Tracking -> Landing.
    pub fn begin_landing(&mut self) -> Result<(), SupervisorError> {
        self.transition(FlightState::Landing)
    }

    /// Move to `Terminated`. Idempotent.
    pub fn terminate(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        // Every non-terminal state may terminate
        let _ = self.transition(FlightState::Terminated);
        self.motion_hold_until = None;
    }

    /// Whether a takeoff may be issued now.
    pub fn can_take_off(&self) -> bool {
        self.state == FlightState::Tracking && !self.airborne && !self.emergency_requested()
    }

    /// Record a successful takeoff. Velocity commands are held at zero until
    /// `settle` has elapsed.
    pub fn mark_airborne(&mut self, now: Instant, settle: Duration) {
        self.airborne = true;
        self.motion_hold_until = Some(now + settle);
        self.shared.publish_airborne(true);
        tracing::info!(settle_ms = settle.as_millis() as u64, "Vehicle airborne");
    }

    /// Record a completed landing.
    pub fn mark_grounded(&mut self) {
        if self.airborne {
            tracing::info!("Vehicle on the ground");
        }
        self.airborne = false;
        self.motion_hold_until = None;
        self.shared.publish_airborne(false);
    }

    /// Whether the post-takeoff settle period is still running.
    pub fn in_motion_hold(&self, now: Instant) -> bool {
        self.motion_hold_until.is_some_and(|until| now < until)
    }

    /// Whether velocity commands may be sent to the vehicle now.
    pub fn allows_motion(&self, now: Instant) -> bool {
        self.state == FlightState::Tracking
            && self.airborne
            && !self.emergency_requested()
            && !self.in_motion_hold(now)
    }

    /// Remove any climb from `command` when the vehicle is at or above the
    /// ceiling.
    ///
    /// A failed altitude read leaves the command unmodified: losing one
    /// reading must not freeze vertical control.
    pub fn apply_altitude_interlock(
        &self,
        command: VelocityCommand,
        altitude: Result<i32, VehicleError>,
        ceiling_cm: i32,
    ) -> VelocityCommand {
        if command.vertical <= 0 {
            return command;
        }
        match altitude {
            Ok(height) if height >= ceiling_cm => {
                tracing::debug!(height_cm = height, ceiling_cm, "Altitude ceiling reached, climb blocked");
                command.without_climb()
            }
            Ok(_) => command,
            Err(e) => {
                tracing::debug!(error = %e, "Altitude unavailable, interlock skipped");
                command
            }
        }
    }

    /// Apply the lost-target policy.
    #[must_use]
    pub fn observe_detection(&self, frames_without_detection: u32) -> SafetyAction {
        if !self.airborne || frames_without_detection == 0 {
            return SafetyAction::Continue;
        }
        match self.lost_target {
            LostTargetPolicy::Hover => SafetyAction::Continue,
            LostTargetPolicy::Land { after_frames } if frames_without_detection >= after_frames => {
                SafetyAction::Land(LandReason::TargetLost {
                    frames: frames_without_detection,
                })
            }
            LostTargetPolicy::Land { .. } => SafetyAction::Continue,
        }
    }

    /// Check a battery reading. Warns once when low, lands when critical and
    /// airborne.
    #[must_use]
    pub fn check_battery(&mut self, percent: u8) -> SafetyAction {
        if percent < self.low_battery_percent && !self.low_battery_warned {
            self.low_battery_warned = true;
            tracing::warn!(battery = percent, threshold = self.low_battery_percent, "Battery low");
        }
        if self.airborne && percent < self.critical_battery_percent {
            return SafetyAction::Land(LandReason::CriticalBattery { percent });
        }
        SafetyAction::Continue
    }
}
