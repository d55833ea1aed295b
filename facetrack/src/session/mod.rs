//! Tracking session: the control loop on its own thread.
//!
//! # Architecture
//!
//! ```text
//!  caller thread                         facetrack-session thread
//!  ─────────────                         ────────────────────────
//!  TrackingSession::start ──spawn──►  initialize: detector ► vehicle ► frames ► first frame
//!                                         │ (cancellation checked between steps)
//!  SessionHandle                          ▼
//!    cancel / stop ──── CancellationToken ─► tracking loop
//!    takeoff / land ─── mpsc (SessionRequest) ─►  frame ► detect ► control ► interlocks ► throttle ► vehicle
//!    emergency_stop ─── AtomicBool + mpsc ──►       │
//!    state / airborne ◄─ SharedFlightState ─┘       └──► TelemetrySink
//!    stop(timeout) ◄──── completion signal ◄── shutdown: zero ► settle ► land ► release
//! ```
//!
//! The loop thread owns every resource. The caller only ever talks to it
//! through the handle, and `stop` never blocks longer than its timeout: a
//! loop that does not wind down in time is detached.

mod rig;
mod worker;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{SessionConfig, SharedTuning};
use crate::detect::{Detector, DetectorError};
use crate::error::SessionError;
use crate::frame::{FrameError, FrameSource};
use crate::supervisor::{FlightState, FlightSupervisor, LandReason, SharedFlightState};
use crate::telemetry::TelemetrySink;
use crate::vehicle::{Vehicle, VehicleError};

pub use rig::Rig;

/// Acquires the external collaborators of a session.
///
/// Called on the session thread, in order: detector, vehicle, frame source.
pub trait SessionFactory: Send + Sync {
    /// Load the face detector. May be slow.
    fn load_detector(&self) -> Result<Box<dyn Detector>, DetectorError>;

    /// Create and connect the vehicle link.
    fn connect_vehicle(&self) -> Result<Box<dyn Vehicle>, VehicleError>;

    /// Open the video stream. The connected vehicle is passed in for
    /// transports that must enable streaming on it first.
    fn open_frame_source(&self, vehicle: &mut dyn Vehicle) -> Result<Box<dyn FrameSource>, FrameError>;
}

/// A request from the caller thread to the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRequest {
    Takeoff,
    Land,
    Emergency,
}

/// How a session that reached tracking came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Stop or cancel was requested.
    Stopped,
    /// Emergency stop was requested.
    Emergency,
    /// The supervisor landed the vehicle.
    SafetyLanding(LandReason),
    /// The video stream ended.
    StreamEnded,
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::Stopped => write!(f, "stopped"),
            SessionEnd::Emergency => write!(f, "emergency stop"),
            SessionEnd::SafetyLanding(reason) => write!(f, "safety landing ({})", reason),
            SessionEnd::StreamEnded => write!(f, "video stream ended"),
        }
    }
}

/// Summary of a completed session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub end: SessionEnd,
    /// Frames processed by the control loop.
    pub cycles: u64,
    /// Frames with a target.
    pub detections: u64,
    pub commands_forwarded: u64,
    pub commands_dropped: u64,
    pub takeoffs: u32,
    /// Average processed frames per second while tracking.
    pub fps: f64,
    /// Time from start to termination.
    pub duration: Duration,
    /// Last battery reading.
    pub battery_percent: Option<u8>,
}

/// Result of waiting for a session to end.
#[derive(Debug)]
pub enum StopOutcome {
    /// The session thread finished within the timeout.
    Completed(Result<SessionReport, SessionError>),
    /// The session thread did not finish in time and was detached.
    TimedOut,
}

impl StopOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, StopOutcome::Completed(_))
    }
}

#[derive(Default)]
struct CompletionState {
    finished: bool,
    outcome: Option<Result<SessionReport, SessionError>>,
}

/// Set once by the session thread when it is done.
#[derive(Default)]
struct Completion {
    state: Mutex<CompletionState>,
    done: Condvar,
}

impl Completion {
    fn finish(&self, outcome: Result<SessionReport, SessionError>) {
        let mut state = self.state.lock();
        state.finished = true;
        state.outcome = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        self.done.wait_while_for(&mut state, |s| !s.finished, timeout);
        state.finished
    }

    fn take(&self) -> Option<Result<SessionReport, SessionError>> {
        self.state.lock().outcome.take()
    }
}

/// Entry point for running a session.
pub struct TrackingSession;

impl TrackingSession {
    /// Validate `config` and spawn the session thread.
    ///
    /// Returns as soon as the thread is running; initialization happens on
    /// the session thread and can be cancelled through the handle.
    pub fn start(
        config: SessionConfig,
        factory: Arc<dyn SessionFactory>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<SessionHandle, SessionError> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let (requests, request_rx) = mpsc::unbounded_channel();
        let tuning = SharedTuning::new(config.control.clone());
        let supervisor = FlightSupervisor::new(&config.safety);
        let shared = supervisor.shared();
        let completion = Arc::new(Completion::default());
        let stop_timeout = config.stop_timeout;

        let worker = worker::Worker::new(
            config,
            factory,
            sink,
            cancel.clone(),
            request_rx,
            tuning.clone(),
            supervisor,
        );

        let thread_completion = Arc::clone(&completion);
        let thread = thread::Builder::new()
            .name("facetrack-session".to_string())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.run()))
                    .unwrap_or_else(|_| {
                        tracing::error!("Session thread panicked");
                        Err(SessionError::Panicked)
                    });
                thread_completion.finish(outcome);
            })
            .map_err(SessionError::ThreadSpawn)?;

        tracing::info!("Tracking session started");

        Ok(SessionHandle {
            cancel,
            requests,
            shared,
            tuning,
            completion,
            thread: Some(thread),
            stop_timeout,
        })
    }
}

/// Controls a running session from another thread.
///
/// Dropping the handle cancels the session without waiting for it.
pub struct SessionHandle {
    cancel: CancellationToken,
    requests: mpsc::UnboundedSender<SessionRequest>,
    shared: SharedFlightState,
    tuning: SharedTuning,
    completion: Arc<Completion>,
    thread: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl SessionHandle {
    /// Ask the session to wind down. Returns immediately.
    ///
    /// Before tracking begins this aborts initialization; afterwards the
    /// vehicle is landed if airborne and resources are released.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait up to `timeout` for the session to end.
    pub fn stop(self, timeout: Duration) -> StopOutcome {
        tracing::info!(timeout_ms = timeout.as_millis() as u64, "Stopping tracking session");
        self.cancel.cancel();
        self.join(timeout)
    }

    /// [`stop`](Self::stop) with the configured stop timeout.
    pub fn stop_default(self) -> StopOutcome {
        let timeout = self.stop_timeout;
        self.stop(timeout)
    }

    /// Wait up to `timeout` for the session to end on its own.
    pub fn join(mut self, timeout: Duration) -> StopOutcome {
        if !self.completion.wait(timeout) {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Session thread did not finish in time, detaching"
            );
            // Dropping the JoinHandle detaches the thread
            self.thread.take();
            return StopOutcome::TimedOut;
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Session thread panicked after completing");
            }
        }

        StopOutcome::Completed(self.completion.take().unwrap_or(Err(SessionError::Panicked)))
    }

    /// Wait up to `timeout` without consuming the handle. Returns `true`
    /// once the session has ended.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.completion.wait(timeout)
    }

    /// Whether the session thread has finished.
    pub fn is_finished(&self) -> bool {
        self.completion.wait(Duration::ZERO)
    }

    /// Request a takeoff. Ignored if already airborne. Returns `false` if
    /// the session is no longer running.
    pub fn request_takeoff(&self) -> bool {
        self.send(SessionRequest::Takeoff)
    }

    /// Request a normal landing. Tracking continues on the ground.
    pub fn request_land(&self) -> bool {
        self.send(SessionRequest::Land)
    }

    /// Stop all motion and land immediately, then end the session.
    pub fn emergency_stop(&self) {
        self.shared.raise_emergency();
        self.send(SessionRequest::Emergency);
        tracing::warn!("Emergency stop requested");
    }

    fn send(&self, request: SessionRequest) -> bool {
        self.requests.send(request).is_ok()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FlightState {
        self.shared.get()
    }

    pub fn is_airborne(&self) -> bool {
        self.shared.is_airborne()
    }

    /// Live control parameters. Changes apply from the next processed frame.
    pub fn tuning(&self) -> &SharedTuning {
        &self.tuning
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.cancel.cancel();
        }
    }
}
