//! The session thread: initialization, tracking loop and shutdown.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;

use super::rig::Rig;
use super::{SessionEnd, SessionFactory, SessionReport, SessionRequest};
use crate::config::{SessionConfig, SharedTuning};
use crate::control::{self, ControllerState, FrameCenter, VelocityCommand};
use crate::detect::TargetDetection;
use crate::error::{InitError, SessionError};
use crate::frame::{Frame, FrameError};
use crate::supervisor::{FlightSupervisor, LandReason, SafetyAction};
use crate::telemetry::{FpsCounter, TelemetrySink, TelemetrySnapshot};
use crate::throttle::CommandThrottle;
use crate::vehicle::VehicleError;

/// Why the tracking loop stopped.
enum LoopExit {
    Stopped,
    Emergency,
    SafetyLanding(LandReason),
    StreamEnded,
    Failed(SessionError),
}

#[derive(Default)]
struct LoopStats {
    cycles: u64,
    detections: u64,
    takeoffs: u32,
    battery_percent: Option<u8>,
    fps: f64,
}

pub(super) struct Worker {
    config: SessionConfig,
    factory: Arc<dyn SessionFactory>,
    sink: Arc<dyn TelemetrySink>,
    cancel: CancellationToken,
    requests: mpsc::UnboundedReceiver<SessionRequest>,
    tuning: SharedTuning,
    supervisor: FlightSupervisor,
    throttle: CommandThrottle,
    controller: ControllerState,
    stats: LoopStats,
}

impl Worker {
    pub(super) fn new(
        config: SessionConfig,
        factory: Arc<dyn SessionFactory>,
        sink: Arc<dyn TelemetrySink>,
        cancel: CancellationToken,
        requests: mpsc::UnboundedReceiver<SessionRequest>,
        tuning: SharedTuning,
        supervisor: FlightSupervisor,
    ) -> Self {
        let throttle = CommandThrottle::new(config.command_interval);
        Self {
            config,
            factory,
            sink,
            cancel,
            requests,
            tuning,
            supervisor,
            throttle,
            controller: ControllerState::default(),
            stats: LoopStats::default(),
        }
    }

    pub(super) fn run(mut self) -> Result<SessionReport, SessionError> {
        let started = Instant::now();
        self.supervisor.begin_initialization()?;

        let mut rig = Rig::new();
        let first_frame = match self.initialize(&mut rig) {
            Ok(frame) => frame,
            Err(e) => {
                if matches!(e, InitError::Cancelled) {
                    tracing::info!("Initialization cancelled");
                } else {
                    tracing::error!(error = %e, "Initialization failed");
                }
                rig.release();
                self.supervisor.terminate();
                return Err(e.into());
            }
        };

        let exit = self.track(&mut rig, first_frame);
        let outcome = self.shutdown(&mut rig, exit);

        rig.release();
        self.supervisor.terminate();

        let end = outcome?;
        let report = SessionReport {
            end,
            cycles: self.stats.cycles,
            detections: self.stats.detections,
            commands_forwarded: self.throttle.forwarded(),
            commands_dropped: self.throttle.dropped(),
            takeoffs: self.stats.takeoffs,
            fps: self.stats.fps,
            duration: started.elapsed(),
            battery_percent: self.stats.battery_percent,
        };
        tracing::info!(
            end = %report.end,
            cycles = report.cycles,
            forwarded = report.commands_forwarded,
            fps = report.fps,
            "Tracking session finished"
        );
        Ok(report)
    }

    /// Fails with [`InitError::Cancelled`] once cancellation or an emergency
    /// has been requested.
    fn checkpoint(&self) -> Result<(), InitError> {
        if self.cancel.is_cancelled() || self.supervisor.emergency_requested() {
            Err(InitError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn initialize(&mut self, rig: &mut Rig) -> Result<Frame, InitError> {
        self.checkpoint()?;
        tracing::info!("Loading detector");
        let detector = self.factory.load_detector().map_err(InitError::Detector)?;
        rig.attach_detector(detector);

        self.checkpoint()?;
        tracing::info!("Connecting to vehicle");
        let mut vehicle = self.factory.connect_vehicle().map_err(InitError::Connect)?;
        match vehicle.battery_percent() {
            Ok(percent) => {
                tracing::info!(battery = percent, "Vehicle connected");
                self.stats.battery_percent = Some(percent);
                match self.supervisor.check_battery(percent) {
                    SafetyAction::Continue => {}
                    // Grounded at connect, so a critical reading only warns
                    SafetyAction::Land(reason) => {
                        tracing::warn!(%reason, "Battery critical before takeoff")
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Vehicle connected, battery unavailable"),
        }
        rig.attach_vehicle(vehicle);

        self.checkpoint()?;
        tracing::info!("Opening video stream");
        let vehicle = rig.vehicle_mut().ok_or(InitError::Connect(VehicleError::NotConnected))?;
        let frames = self
            .factory
            .open_frame_source(vehicle)
            .map_err(InitError::FrameSource)?;
        rig.attach_frames(frames);

        self.wait_first_frame(rig)
    }

    fn wait_first_frame(&self, rig: &mut Rig) -> Result<Frame, InitError> {
        let timeout = self.config.first_frame_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            self.checkpoint()?;
            if let Some(frame) = rig.next_frame() {
                tracing::info!(
                    width = frame.width(),
                    height = frame.height(),
                    "First frame received"
                );
                return Ok(frame);
            }
            if rig.frames_exhausted() {
                return Err(InitError::FrameSource(FrameError::EndOfStream));
            }
            if Instant::now() >= deadline {
                return Err(InitError::FirstFrame {
                    timeout_ms: timeout.as_millis(),
                });
            }
            thread::sleep(self.config.loop_interval);
        }
    }

    fn track(&mut self, rig: &mut Rig, first_frame: Frame) -> LoopExit {
        if let Err(e) = self.supervisor.begin_tracking(FrameCenter::of(&first_frame)) {
            return LoopExit::Failed(e.into());
        }

        let mut fps = FpsCounter::new();
        fps.start(Instant::now());
        let mut pending = Some(first_frame);
        let mut next_battery_poll = Instant::now() + self.config.telemetry_poll_interval;

        loop {
            if let Some(exit) = self.poll_control(rig) {
                return exit;
            }

            let now = Instant::now();
            if now >= next_battery_poll {
                next_battery_poll = now + self.config.telemetry_poll_interval;
                if let Some(exit) = self.poll_battery(rig) {
                    return exit;
                }
            }

            let Some(frame) = pending.take().or_else(|| rig.next_frame()) else {
                if rig.frames_exhausted() {
                    tracing::info!("Video stream ended");
                    return LoopExit::StreamEnded;
                }
                thread::sleep(self.config.loop_interval);
                continue;
            };

            let center = FrameCenter::of(&frame);
            self.supervisor.update_center(center);
            let tuning = self.tuning.snapshot();

            let detection = match rig.detect(&frame, tuning.confidence_threshold) {
                Ok(detection) => detection,
                Err(e) => {
                    tracing::warn!(error = %e, "Detection failed, treating frame as empty");
                    None
                }
            };
            if detection.is_some() {
                self.stats.detections += 1;
            }

            let (command, next) =
                control::evaluate(detection.as_ref(), center, &tuning, &self.controller, Instant::now());
            self.controller = next;

            if let SafetyAction::Land(reason) = self
                .supervisor
                .observe_detection(self.controller.frames_without_detection)
            {
                return LoopExit::SafetyLanding(reason);
            }

            let (sent, forwarded) = match self.actuate(rig, command) {
                Ok(result) => result,
                Err(exit) => return exit,
            };

            self.stats.cycles += 1;
            self.stats.fps = fps.record(Instant::now());
            self.publish(frame, detection, sent, forwarded);

            thread::sleep(self.config.loop_interval);
        }
    }

    /// Pass `command` through the motion gate, throttle and altitude
    /// interlock, and send it if due. Returns the command after interlocks
    /// and whether it was sent.
    fn actuate(
        &mut self,
        rig: &mut Rig,
        command: VelocityCommand,
    ) -> Result<(VelocityCommand, bool), LoopExit> {
        let motion = self.supervisor.allows_motion(Instant::now());
        let mut command = if motion { command } else { VelocityCommand::HOLD };

        if !self.throttle.offer(motion) {
            return Ok((command, false));
        }

        // Requests that arrived during this cycle win over the command
        if let Some(exit) = self.poll_control(rig) {
            return Err(exit);
        }
        if !self.supervisor.allows_motion(Instant::now()) {
            return Ok((VelocityCommand::HOLD, false));
        }

        if command.vertical > 0 {
            let altitude = rig.altitude_cm();
            command = self.supervisor.apply_altitude_interlock(
                command,
                altitude,
                self.config.safety.max_altitude_cm,
            );
        }

        match rig.send_velocity(command) {
            Ok(()) => {
                tracing::trace!(%command, "Velocity command sent");
                Ok((command, true))
            }
            Err(e) => {
                tracing::error!(error = %e, %command, "Velocity command failed");
                Err(LoopExit::Failed(SessionError::ActuatorCommand(e)))
            }
        }
    }

    /// Check for stop and emergency, then handle queued requests.
    fn poll_control(&mut self, rig: &mut Rig) -> Option<LoopExit> {
        loop {
            if self.cancel.is_cancelled() {
                return Some(LoopExit::Stopped);
            }
            if self.supervisor.emergency_requested() {
                return Some(LoopExit::Emergency);
            }

            match self.requests.try_recv() {
                Ok(SessionRequest::Takeoff) => self.handle_takeoff(rig),
                Ok(SessionRequest::Land) => {
                    if let Err(e) = self.handle_land(rig) {
                        return Some(LoopExit::Failed(e));
                    }
                }
                Ok(SessionRequest::Emergency) => return Some(LoopExit::Emergency),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            }
        }
    }

    fn poll_battery(&mut self, rig: &mut Rig) -> Option<LoopExit> {
        match rig.battery_percent() {
            Ok(percent) => {
                self.stats.battery_percent = Some(percent);
                if let SafetyAction::Land(reason) = self.supervisor.check_battery(percent) {
                    tracing::warn!(%reason, "Landing for safety");
                    return Some(LoopExit::SafetyLanding(reason));
                }
            }
            Err(e) => tracing::debug!(error = %e, "Battery read failed"),
        }
        None
    }

    fn handle_takeoff(&mut self, rig: &mut Rig) {
        if !self.supervisor.can_take_off() {
            tracing::debug!(airborne = self.supervisor.is_airborne(), "Takeoff request ignored");
            return;
        }

        tracing::info!("Taking off");
        if let Err(e) = rig.send_velocity(VelocityCommand::HOLD) {
            tracing::debug!(error = %e, "Pre-takeoff stop command failed");
        }
        match rig.takeoff() {
            Ok(()) => {
                self.supervisor
                    .mark_airborne(Instant::now(), self.config.takeoff_settle);
                self.throttle.reset();
                self.controller = ControllerState::default();
                self.stats.takeoffs += 1;
            }
            Err(e) => tracing::warn!(error = %e, "Takeoff failed, staying on the ground"),
        }
    }

    fn handle_land(&mut self, rig: &mut Rig) -> Result<(), SessionError> {
        if !self.supervisor.is_airborne() {
            tracing::debug!("Land request ignored, not airborne");
            return Ok(());
        }
        tracing::info!("Landing");
        self.land_sequence(rig, self.config.landing_settle)
            .map_err(SessionError::ActuatorCommand)?;
        self.throttle.reset();
        Ok(())
    }

    /// Zero velocity, settle, land. The zero command bypasses the throttle.
    fn land_sequence(&mut self, rig: &mut Rig, settle: Duration) -> Result<(), VehicleError> {
        send_hold(rig);
        self.settle_and_land(rig, settle)
    }

    fn settle_and_land(&mut self, rig: &mut Rig, settle: Duration) -> Result<(), VehicleError> {
        thread::sleep(settle);
        rig.land()?;
        self.supervisor.mark_grounded();
        Ok(())
    }

    fn shutdown(&mut self, rig: &mut Rig, exit: LoopExit) -> Result<SessionEnd, SessionError> {
        let end = match exit {
            LoopExit::Emergency => {
                if let Err(e) = self.supervisor.request_emergency() {
                    tracing::debug!(error = %e, "Emergency transition skipped");
                }
                send_hold(rig);
                if self.supervisor.is_airborne() {
                    tracing::warn!("Emergency landing");
                    self.settle_and_land(rig, self.config.emergency_settle)
                        .map_err(SessionError::ActuatorCommand)?;
                }
                SessionEnd::Emergency
            }
            LoopExit::Stopped => self.land_if_airborne(rig, SessionEnd::Stopped)?,
            LoopExit::StreamEnded => self.land_if_airborne(rig, SessionEnd::StreamEnded)?,
            LoopExit::SafetyLanding(reason) => {
                self.land_if_airborne(rig, SessionEnd::SafetyLanding(reason))?
            }
            LoopExit::Failed(err) => {
                if self.supervisor.is_airborne() {
                    tracing::warn!(error = %err, "Forcing landing after failure");
                    if let Err(e) = self.supervisor.begin_landing() {
                        tracing::debug!(error = %e, "Landing transition skipped");
                    }
                    if let Err(e) = self.land_sequence(rig, self.config.landing_settle) {
                        tracing::error!(error = %e, "Forced landing failed");
                    }
                }
                return Err(err);
            }
        };
        Ok(end)
    }

    fn land_if_airborne(&mut self, rig: &mut Rig, end: SessionEnd) -> Result<SessionEnd, SessionError> {
        if self.supervisor.is_airborne() {
            self.supervisor.begin_landing()?;
            tracing::info!(reason = %end, "Landing before shutdown");
            self.land_sequence(rig, self.config.landing_settle)
                .map_err(SessionError::ActuatorCommand)?;
        }
        Ok(end)
    }

    fn publish(
        &self,
        frame: Frame,
        detection: Option<TargetDetection>,
        command: VelocityCommand,
        forwarded: bool,
    ) {
        self.sink.publish(TelemetrySnapshot {
            cycle: self.stats.cycles,
            frame: Some(frame),
            detection,
            command,
            forwarded,
            fps: self.stats.fps,
            battery_percent: self.stats.battery_percent,
            flight_state: self.supervisor.state(),
            airborne: self.supervisor.is_airborne(),
            frames_without_detection: self.controller.frames_without_detection,
        });
    }
}

/// Send a zero-velocity command outside the throttle.
fn send_hold(rig: &mut Rig) {
    if let Err(e) = rig.send_velocity(VelocityCommand::HOLD) {
        tracing::warn!(error = %e, "Stop command failed");
    }
}
