//! Integration tests for tracking sessions.
//!
//! These tests drive a complete session against the closed-loop simulator:
//! - Initialization, cancellation and initialization failures
//! - Takeoff, tracking convergence, landing and shutdown ordering
//! - Emergency stop and the safety interlocks
//!
//! Run with: `cargo test --test session_integration`

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use facetrack::config::SessionConfig;
use facetrack::control::VelocityCommand;
use facetrack::error::{InitError, SessionError};
use facetrack::session::{SessionEnd, SessionHandle, SessionReport, StopOutcome, TrackingSession};
use facetrack::sim::{CallLog, FrameMode, SimFactory, SimFaults, SimWorld, VehicleCall, WorldConfig};
use facetrack::supervisor::{FlightState, LandReason, LostTargetPolicy};
use facetrack::telemetry::{MemorySink, NullSink, TelemetrySink};

// ============================================================================
// Helper Functions
// ============================================================================

const WAIT: Duration = Duration::from_secs(10);

/// A small world so frames are cheap to hash and scan.
fn test_world() -> SimWorld {
    SimWorld::new(WorldConfig {
        width: 320,
        height: 240,
        target_x: 160.0,
        target_y: 120.0,
        target_size: 60.0,
        px_per_cm: 6.0,
        ..WorldConfig::default()
    })
}

/// Short timings for tests.
fn fast_config() -> SessionConfig {
    let mut config = SessionConfig {
        command_interval: 1,
        loop_interval: Duration::from_millis(2),
        first_frame_timeout: Duration::from_secs(3),
        stop_timeout: Duration::from_secs(5),
        takeoff_settle: Duration::from_millis(50),
        landing_settle: Duration::from_millis(10),
        emergency_settle: Duration::from_millis(10),
        telemetry_poll_interval: Duration::from_millis(50),
        ..SessionConfig::default()
    };
    config.control.target_face_size = 60;
    config
}

struct Harness {
    handle: SessionHandle,
    world: SimWorld,
    log: CallLog,
    faults: SimFaults,
}

fn start_with_sink(config: SessionConfig, factory: SimFactory, sink: Arc<dyn TelemetrySink>) -> Harness {
    let world = factory.world();
    let log = factory.log();
    let faults = factory.faults();
    let handle = TrackingSession::start(config, Arc::new(factory), sink).unwrap();
    Harness {
        handle,
        world,
        log,
        faults,
    }
}

fn start(config: SessionConfig, factory: SimFactory) -> Harness {
    start_with_sink(config, factory, Arc::new(NullSink))
}

/// Poll `condition` until it holds or `timeout` elapses.
fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn completed(outcome: StopOutcome) -> Result<SessionReport, SessionError> {
    match outcome {
        StopOutcome::Completed(result) => result,
        StopOutcome::TimedOut => panic!("session did not finish in time"),
    }
}

fn wait_tracking(handle: &SessionHandle) {
    assert!(
        wait_for(WAIT, || handle.state() == FlightState::Tracking),
        "session never reached Tracking"
    );
}

fn take_off(handle: &SessionHandle) {
    wait_tracking(handle);
    assert!(handle.request_takeoff());
    assert!(wait_for(WAIT, || handle.is_airborne()), "vehicle never took off");
}

fn is_land(call: &VehicleCall) -> bool {
    matches!(call, VehicleCall::Land)
}

// ============================================================================
// Initialization
// ============================================================================

/// Stopping right after start never moves the vehicle.
#[test]
fn test_stop_before_start_completes() {
    let h = start(fast_config(), SimFactory::new(test_world()));
    h.handle.cancel();

    assert!(h.handle.wait(WAIT));
    assert_eq!(h.handle.state(), FlightState::Terminated);

    match completed(h.handle.join(WAIT)) {
        Ok(report) => assert_eq!(report.end, SessionEnd::Stopped),
        Err(e) => assert!(e.is_cancelled(), "unexpected error: {e}"),
    }

    assert!(h.log.motion_commands().is_empty());
    assert_eq!(h.log.count(|c| matches!(c, VehicleCall::Takeoff)), 0);
    assert_eq!(
        h.log.count(|c| matches!(c, VehicleCall::Connect)),
        h.log.count(|c| matches!(c, VehicleCall::Disconnect))
    );
}

/// Cancelling while the detector loads aborts before the vehicle is touched.
#[test]
fn test_cancel_during_detector_load_skips_connect() {
    let factory = SimFactory::new(test_world()).with_detector_delay(Duration::from_millis(300));
    let h = start(fast_config(), factory);

    thread::sleep(Duration::from_millis(50));
    let err = completed(h.handle.stop(WAIT)).unwrap_err();

    assert!(err.is_cancelled());
    assert!(h.log.is_empty(), "vehicle calls made: {:?}", h.log.calls());
}

/// A cancel that arrives while connecting still disconnects the link once
/// the connect call returns.
#[test]
fn test_cancel_during_connect_releases_vehicle() {
    let factory = SimFactory::new(test_world());
    factory.faults().set_connect_delay(Duration::from_millis(300));
    let h = start(fast_config(), factory);

    assert!(wait_for(WAIT, || h.log.count(|c| matches!(c, VehicleCall::Connect)) == 1));
    h.handle.cancel();
    let err = completed(h.handle.join(WAIT)).unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(h.log.count(|c| matches!(c, VehicleCall::Disconnect)), 1);
    assert_eq!(h.log.calls().last(), Some(&VehicleCall::Disconnect));
    assert!(h.log.velocity_commands().is_empty());
    assert_eq!(h.log.count(|c| matches!(c, VehicleCall::Takeoff)), 0);
}

/// A session stuck in a slow step is detached once the stop timeout expires.
#[test]
fn test_stop_times_out_on_stuck_session() {
    let factory = SimFactory::new(test_world()).with_detector_delay(Duration::from_secs(3));
    let h = start(fast_config(), factory);
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    let outcome = h.handle.stop(Duration::from_millis(200));
    let elapsed = started.elapsed();

    assert!(matches!(outcome, StopOutcome::TimedOut));
    assert!(elapsed < Duration::from_secs(2), "stop took {:?}", elapsed);
    assert!(h.log.is_empty());
}

#[test]
fn test_connect_failure_terminates() {
    let factory = SimFactory::new(test_world());
    factory.faults().set_connect_failure(true);
    let h = start(fast_config(), factory);

    assert!(h.handle.wait(WAIT));
    assert_eq!(h.handle.state(), FlightState::Terminated);

    let err = completed(h.handle.join(WAIT)).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Initialization(InitError::Connect(facetrack::vehicle::VehicleError::Timeout))
    ));
    assert_eq!(h.log.calls(), vec![VehicleCall::Connect]);
}

#[test]
fn test_detector_failure_terminates_without_connecting() {
    let factory = SimFactory::new(test_world()).with_detector_failure("model file missing");
    let h = start(fast_config(), factory);

    let err = completed(h.handle.join(WAIT)).unwrap_err();
    assert!(matches!(err, SessionError::Initialization(InitError::Detector(_))));
    assert!(h.log.is_empty());
}

/// A stream that never delivers fails initialization and releases the
/// vehicle.
#[test]
fn test_first_frame_timeout() {
    for mode in [FrameMode::Polled, FrameMode::Threaded] {
        let factory = SimFactory::new(test_world())
            .with_frame_mode(mode)
            .with_frozen_camera();
        let config = SessionConfig {
            first_frame_timeout: Duration::from_millis(200),
            ..fast_config()
        };
        let h = start(config, factory);

        let err = completed(h.handle.join(WAIT)).unwrap_err();
        assert!(
            matches!(err, SessionError::Initialization(InitError::FirstFrame { .. })),
            "{mode}: {err}"
        );
        assert_eq!(h.log.count(|c| matches!(c, VehicleCall::Disconnect)), 1, "{mode}");
    }
}

#[test]
fn test_invalid_config_is_rejected_before_start() {
    let config = SessionConfig {
        command_interval: 0,
        ..fast_config()
    };
    let result = TrackingSession::start(config, Arc::new(SimFactory::new(test_world())), Arc::new(NullSink));
    assert!(matches!(result, Err(SessionError::Config(_))));
}

// ============================================================================
// Tracking
// ============================================================================

/// The closed loop pulls an off-centre target back into the dead zone.
#[test]
fn test_takeoff_and_track_converges() {
    let factory = SimFactory::new(test_world());
    let h = start(fast_config(), factory);
    h.world.set_target(260.0, 120.0, 60.0);

    take_off(&h.handle);
    let converged = wait_for(WAIT, || h.world.target_offset().0.abs() <= 45.0);
    assert!(converged, "target offset stayed at {:?}", h.world.target_offset());

    let report = completed(h.handle.stop(WAIT)).unwrap();
    assert_eq!(report.end, SessionEnd::Stopped);
    assert_eq!(report.takeoffs, 1);
    assert!(report.commands_forwarded > 0);
    assert!(report.detections > 0);

    // Shutdown order: zero, land, disconnect
    let calls = h.log.calls();
    let n = calls.len();
    assert_eq!(
        &calls[n - 3..],
        &[
            VehicleCall::SetVelocity(VelocityCommand::HOLD),
            VehicleCall::Land,
            VehicleCall::Disconnect
        ]
    );
    assert!(!h.world.is_airborne());
}

/// Nothing but zero commands reaches the vehicle during the takeoff settle.
#[test]
fn test_motion_held_after_takeoff() {
    let config = SessionConfig {
        takeoff_settle: Duration::from_secs(30),
        ..fast_config()
    };
    let h = start(config, SimFactory::new(test_world()));
    h.world.set_target(260.0, 60.0, 60.0);

    take_off(&h.handle);
    thread::sleep(Duration::from_millis(300));

    assert!(h.log.motion_commands().is_empty());
    completed(h.handle.stop(WAIT)).unwrap();
}

#[test]
fn test_second_takeoff_is_ignored() {
    let h = start(fast_config(), SimFactory::new(test_world()));
    take_off(&h.handle);

    assert!(h.handle.request_takeoff());
    thread::sleep(Duration::from_millis(100));

    let report = completed(h.handle.stop(WAIT)).unwrap();
    assert_eq!(report.takeoffs, 1);
    assert_eq!(h.log.count(|c| matches!(c, VehicleCall::Takeoff)), 1);
}

/// A land request ends the flight but not the session.
#[test]
fn test_land_keeps_tracking() {
    let h = start(fast_config(), SimFactory::new(test_world()));
    take_off(&h.handle);

    assert!(h.handle.request_land());
    assert!(wait_for(WAIT, || !h.handle.is_airborne()));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(h.handle.state(), FlightState::Tracking);

    let report = completed(h.handle.stop(WAIT)).unwrap();
    assert_eq!(report.end, SessionEnd::Stopped);
    assert_eq!(h.log.count(is_land), 1);
    assert_eq!(h.log.count(|c| matches!(c, VehicleCall::Disconnect)), 1);
}

#[test]
fn test_stream_end_finishes_session() {
    for mode in [FrameMode::Polled, FrameMode::Threaded] {
        let factory = SimFactory::new(test_world())
            .with_frame_mode(mode)
            .with_camera_fps(100)
            .with_frame_limit(20);
        let h = start(fast_config(), factory);

        let report = completed(h.handle.join(WAIT)).unwrap();
        assert_eq!(report.end, SessionEnd::StreamEnded, "{mode}");
        assert!(report.cycles > 0 && report.cycles <= 20, "{mode}: {} cycles", report.cycles);
    }
}

#[test]
fn test_telemetry_published_per_cycle() {
    let sink = Arc::new(MemorySink::new(256));
    let factory = SimFactory::new(test_world()).with_camera_fps(100).with_frame_limit(10);
    let h = start_with_sink(fast_config(), factory, sink.clone());

    let report = completed(h.handle.join(WAIT)).unwrap();
    assert_eq!(sink.len() as u64, report.cycles);

    let latest = sink.latest().unwrap();
    assert_eq!(latest.flight_state, FlightState::Tracking);
    assert!(latest.detection.is_some());
    assert!(!latest.forwarded);
    assert!(latest.frame.is_some());
}

// ============================================================================
// Emergency and Safety Interlocks
// ============================================================================

/// Emergency sends zero velocity immediately before land, even when the
/// throttle would not forward anything.
#[test]
fn test_emergency_zero_before_land() {
    let config = SessionConfig {
        command_interval: 1000,
        ..fast_config()
    };
    let h = start(config, SimFactory::new(test_world()));
    take_off(&h.handle);

    h.handle.emergency_stop();
    assert!(h.handle.wait(WAIT));
    assert_eq!(h.handle.state(), FlightState::Terminated);

    let report = completed(h.handle.join(WAIT)).unwrap();
    assert_eq!(report.end, SessionEnd::Emergency);

    let calls = h.log.calls();
    let land = h.log.position(is_land).expect("land was sent");
    assert!(land > 0);
    assert_eq!(calls[land - 1], VehicleCall::SetVelocity(VelocityCommand::HOLD));
    assert_eq!(h.log.count(is_land), 1);
    assert!(!h.world.is_airborne());
}

/// Emergency while grounded still sends one zero command, but no land.
#[test]
fn test_emergency_on_ground() {
    let h = start(fast_config(), SimFactory::new(test_world()));
    wait_tracking(&h.handle);

    h.handle.emergency_stop();
    let report = completed(h.handle.join(WAIT)).unwrap();
    assert_eq!(report.end, SessionEnd::Emergency);
    assert_eq!(h.log.velocity_commands(), vec![VelocityCommand::HOLD]);
    assert_eq!(h.log.count(is_land), 0);

    let calls = h.log.calls();
    let hold = VehicleCall::SetVelocity(VelocityCommand::HOLD);
    assert_eq!(calls[calls.len() - 2..], [hold, VehicleCall::Disconnect]);
}

/// A velocity command that fails while airborne ends the session with an
/// actuator error after a forced zero command and land.
#[test]
fn test_command_failure_forces_landing() {
    let h = start(fast_config(), SimFactory::new(test_world()));
    h.world.set_target(220.0, 120.0, 60.0);
    take_off(&h.handle);
    assert!(wait_for(WAIT, || !h.log.motion_commands().is_empty()));

    h.faults.set_command_failure(true);
    let err = completed(h.handle.join(WAIT)).unwrap_err();

    assert!(matches!(err, SessionError::ActuatorCommand(_)), "unexpected error: {:?}", err);

    let calls = h.log.calls();
    assert!(calls.len() >= 4);
    assert!(matches!(calls[calls.len() - 4], VehicleCall::SetVelocity(_)));
    assert_eq!(
        calls[calls.len() - 3..],
        [
            VehicleCall::SetVelocity(VelocityCommand::HOLD),
            VehicleCall::Land,
            VehicleCall::Disconnect
        ]
    );
    assert_eq!(h.log.count(is_land), 1);
}

/// Above the ceiling, climb never reaches the vehicle.
#[test]
fn test_altitude_ceiling_blocks_climb() {
    let mut config = fast_config();
    config.safety.max_altitude_cm = 10;
    let h = start(config, SimFactory::new(test_world()));
    h.world.set_target(160.0, 40.0, 60.0);

    take_off(&h.handle);
    assert!(wait_for(WAIT, || h.log.count(|c| matches!(c, VehicleCall::AltitudeCm)) > 0));
    thread::sleep(Duration::from_millis(100));
    completed(h.handle.stop(WAIT)).unwrap();

    assert!(h.log.velocity_commands().iter().all(|cmd| cmd.vertical <= 0));
}

/// A failed altitude read leaves the command as computed.
#[test]
fn test_altitude_read_failure_forwards_unmodified() {
    let mut config = fast_config();
    config.safety.max_altitude_cm = 10;
    let h = start(config, SimFactory::new(test_world()));
    h.faults.set_telemetry_failure(true);
    h.world.set_target(160.0, 40.0, 60.0);

    take_off(&h.handle);
    let climbed = wait_for(WAIT, || h.log.velocity_commands().iter().any(|cmd| cmd.vertical > 0));
    completed(h.handle.stop(WAIT)).unwrap();

    assert!(climbed, "no climb command was forwarded");
}

#[test]
fn test_critical_battery_lands() {
    let world = SimWorld::new(WorldConfig {
        width: 320,
        height: 240,
        target_x: 160.0,
        target_y: 120.0,
        target_size: 60.0,
        initial_battery: 8.0,
        battery_drain_per_sec: 0.0,
        ..WorldConfig::default()
    });
    let h = start(fast_config(), SimFactory::new(world));
    wait_tracking(&h.handle);
    h.handle.request_takeoff();

    let report = completed(h.handle.join(WAIT)).unwrap();
    assert_eq!(
        report.end,
        SessionEnd::SafetyLanding(LandReason::CriticalBattery { percent: 8 })
    );
    assert_eq!(report.battery_percent, Some(8));
    assert_eq!(h.log.count(is_land), 1);
}

/// A critical reading at connect only warns while the vehicle is grounded.
#[test]
fn test_critical_battery_at_connect_keeps_tracking() {
    let world = SimWorld::new(WorldConfig {
        width: 320,
        height: 240,
        target_x: 160.0,
        target_y: 120.0,
        target_size: 60.0,
        initial_battery: 8.0,
        battery_drain_per_sec: 0.0,
        ..WorldConfig::default()
    });
    let h = start(fast_config(), SimFactory::new(world));
    wait_tracking(&h.handle);
    thread::sleep(Duration::from_millis(150));
    assert_eq!(h.handle.state(), FlightState::Tracking);

    let report = completed(h.handle.stop(WAIT)).unwrap();
    assert_eq!(report.end, SessionEnd::Stopped);
    assert_eq!(report.battery_percent, Some(8));
    assert_eq!(h.log.count(is_land), 0);
}

#[test]
fn test_lost_target_lands_when_configured() {
    let mut config = fast_config();
    config.safety.lost_target = LostTargetPolicy::Land { after_frames: 5 };
    let h = start(config, SimFactory::new(test_world()));
    take_off(&h.handle);

    h.world.hide_target();
    let report = completed(h.handle.join(WAIT)).unwrap();

    assert_eq!(
        report.end,
        SessionEnd::SafetyLanding(LandReason::TargetLost { frames: 5 })
    );
    assert_eq!(h.log.count(is_land), 1);
}

#[test]
fn test_lost_target_hovers_by_default() {
    let h = start(fast_config(), SimFactory::new(test_world()));
    take_off(&h.handle);

    h.world.hide_target();
    thread::sleep(Duration::from_millis(300));
    assert!(h.handle.is_airborne());
    assert!(!h.handle.is_finished());
    assert_eq!(h.log.count(is_land), 0);

    completed(h.handle.stop(WAIT)).unwrap();
}

/// Live tuning changes apply without restarting.
#[test]
fn test_live_tuning_update() {
    let h = start(fast_config(), SimFactory::new(test_world()));
    wait_tracking(&h.handle);

    h.handle.tuning().update(|c| c.dead_zone = 10).unwrap();
    assert_eq!(h.handle.tuning().snapshot().dead_zone, 10);
    assert!(h.handle.tuning().update(|c| c.kp_x = -1.0).is_err());
    assert_eq!(h.handle.tuning().snapshot().kp_x, fast_config().control.kp_x);

    completed(h.handle.stop(WAIT)).unwrap();
}
