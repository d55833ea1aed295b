//! Feedback control law.
//!
//! Turns the position and size of the tracked face into a four-axis velocity
//! command. Each axis runs a proportional-derivative term with a few
//! heuristics layered on top:
//!
//! | Step | Lateral (x) | Vertical (y) | Longitudinal (size) |
//! |------|-------------|--------------|---------------------|
//! | Dead zone (inclusive) | `dead_zone` | `dead_zone` | `face_size_tolerance` |
//! | Oscillation damping | P × 0.5 on sign flip | same | same |
//! | Latency adaptation | P × `2·nominal/dt` when stale | same | same |
//! | Proximity softening | × 0.6 inside `2·dead_zone` | × 0.6 | × 0.8 inside `2·tolerance` |
//! | Sign mapping | as is | negated | negated |
//!
//! Yaw follows the lateral term (`0.3 ×`) only when the horizontal error is
//! large. Every output is truncated toward zero and clamped to its axis
//! limit.
//!
//! [`evaluate`] is pure: the previous state and the current time are passed
//! in, the next state is returned.

mod axis;

use std::time::Instant;

use serde::Serialize;

use crate::config::ControlConfig;
use crate::detect::TargetDetection;
use crate::frame::Frame;

pub use axis::{apply_dead_zone, AxisTerms, Timing, OSCILLATION_DAMPING, STALE_PERIOD_MULTIPLE};

/// Multiplier on lateral and vertical output near the centre.
pub const CENTER_SOFTENING: f64 = 0.6;

/// Multiplier on longitudinal output near the target size.
pub const SIZE_SOFTENING: f64 = 0.8;

/// Fraction of the lateral output applied as yaw for large offsets.
pub const YAW_FRACTION: f64 = 0.3;

/// A four-axis velocity command in vehicle convention.
///
/// Lateral is positive to the right, longitudinal positive forward, vertical
/// positive up and yaw positive clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct VelocityCommand {
    pub lateral: i32,
    pub longitudinal: i32,
    pub vertical: i32,
    pub yaw: i32,
}

impl VelocityCommand {
    /// Hold position.
    pub const HOLD: Self = Self {
        lateral: 0,
        longitudinal: 0,
        vertical: 0,
        yaw: 0,
    };

    pub fn new(lateral: i32, longitudinal: i32, vertical: i32, yaw: i32) -> Self {
        Self {
            lateral,
            longitudinal,
            vertical,
            yaw,
        }
    }

    /// Whether every axis is zero.
    pub fn is_hold(&self) -> bool {
        *self == Self::HOLD
    }

    /// Clamp each axis to `[-limit, limit]` for its configured limit.
    pub fn clamped(self, config: &ControlConfig) -> Self {
        Self {
            lateral: clamp_axis(self.lateral, config.max_speed_horizontal),
            longitudinal: clamp_axis(self.longitudinal, config.max_speed_forward),
            vertical: clamp_axis(self.vertical, config.max_speed_vertical),
            yaw: clamp_axis(self.yaw, config.max_speed_yaw),
        }
    }

    /// Same command with any climb removed.
    pub fn without_climb(self) -> Self {
        Self {
            vertical: self.vertical.min(0),
            ..self
        }
    }
}

impl std::fmt::Display for VelocityCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(lr={}, fb={}, ud={}, yaw={})",
            self.lateral, self.longitudinal, self.vertical, self.yaw
        )
    }
}

fn clamp_axis(value: i32, limit: i32) -> i32 {
    let limit = limit.max(0);
    value.clamp(-limit, limit)
}

/// The setpoint: the pixel at the centre of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameCenter {
    pub x: i32,
    pub y: i32,
}

impl FrameCenter {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Centre of a frame of the given dimensions.
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        Self {
            x: (width / 2) as i32,
            y: (height / 2) as i32,
        }
    }

    /// Centre of `frame`.
    pub fn of(frame: &Frame) -> Self {
        Self::from_dimensions(frame.width(), frame.height())
    }
}

/// State carried from one evaluation to the next.
///
/// Errors are stored after the dead zone has been applied.
/// `ControllerState::default()` is the initial condition of every session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerState {
    pub last_error_x: i32,
    pub last_error_y: i32,
    pub last_error_size: i32,
    pub last_command_time: Option<Instant>,
    pub frames_without_detection: u32,
}

/// Compute the velocity command for one frame.
///
/// With no detection the command is [`VelocityCommand::HOLD`] and only the
/// missed-frame counter advances; the stored errors and timestamp are kept so
/// the derivative resumes smoothly when the target reappears.
pub fn evaluate(
    detection: Option<&TargetDetection>,
    center: FrameCenter,
    config: &ControlConfig,
    state: &ControllerState,
    now: Instant,
) -> (VelocityCommand, ControllerState) {
    let Some(target) = detection else {
        let next = ControllerState {
            frames_without_detection: state.frames_without_detection.saturating_add(1),
            ..state.clone()
        };
        return (VelocityCommand::HOLD, next);
    };

    let timing = Timing::measure(
        state.last_command_time,
        now,
        config.nominal_frame_period,
        config.max_accepted_dt,
    );

    let raw_x = target.center_x.saturating_sub(center.x);
    let raw_y = target.center_y.saturating_sub(center.y);
    let raw_size = target.size().saturating_sub(config.target_face_size);

    let error_x = apply_dead_zone(raw_x, config.dead_zone);
    let error_y = apply_dead_zone(raw_y, config.dead_zone);
    let error_size = apply_dead_zone(raw_size, config.face_size_tolerance);

    let center_band = config.dead_zone.saturating_mul(2);
    let size_band = config.face_size_tolerance.saturating_mul(2);

    let mut lateral =
        AxisTerms::compute(error_x, state.last_error_x, config.kp_x, config.kd_x, &timing).total();
    if error_x != 0 && raw_x.unsigned_abs() < center_band.max(0) as u32 {
        lateral *= CENTER_SOFTENING;
    }

    let mut vertical =
        AxisTerms::compute(error_y, state.last_error_y, config.kp_y, config.kd_y, &timing).total();
    if error_y != 0 && raw_y.unsigned_abs() < center_band.max(0) as u32 {
        vertical *= CENTER_SOFTENING;
    }

    let mut longitudinal = AxisTerms::compute(
        error_size,
        state.last_error_size,
        config.kp_size,
        config.kd_size,
        &timing,
    )
    .total();
    if error_size != 0 && raw_size.unsigned_abs() < size_band.max(0) as u32 {
        longitudinal *= SIZE_SOFTENING;
    }

    let yaw = if raw_x.unsigned_abs() > center_band.max(0) as u32 {
        lateral * YAW_FRACTION
    } else {
        0.0
    };

    // Image y grows downward and a large face means too close
    let command = VelocityCommand {
        lateral: lateral as i32,
        longitudinal: -longitudinal as i32,
        vertical: -vertical as i32,
        yaw: yaw as i32,
    }
    .clamped(config);

    let next = ControllerState {
        last_error_x: error_x,
        last_error_y: error_y,
        last_error_size: error_size,
        last_command_time: Some(now),
        frames_without_detection: 0,
    };

    (command, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn config() -> ControlConfig {
        ControlConfig::default()
    }

    /// Gains chosen so every term is easy to compute by hand.
    fn proportional_only(kp: f64) -> ControlConfig {
        ControlConfig {
            kp_x: kp,
            kd_x: 0.0,
            kp_y: kp,
            kd_y: 0.0,
            kp_size: kp,
            kd_size: 0.0,
            max_speed_horizontal: 100,
            max_speed_forward: 100,
            max_speed_vertical: 100,
            max_speed_yaw: 100,
            ..ControlConfig::default()
        }
    }

    fn target(center_x: i32, center_y: i32, size: i32) -> TargetDetection {
        TargetDetection {
            center_x,
            center_y,
            width: size,
            height: size,
            confidence: 0.9,
        }
    }

    const CENTER: FrameCenter = FrameCenter { x: 320, y: 240 };

    #[test]
    fn test_centered_target_holds() {
        let cfg = config();
        let (cmd, next) = evaluate(
            Some(&target(330, 250, 150)),
            CENTER,
            &cfg,
            &ControllerState::default(),
            Instant::now(),
        );

        assert!(cmd.is_hold());
        assert_eq!(next.last_error_x, 0);
        assert_eq!(next.last_error_y, 0);
        assert_eq!(next.last_error_size, 0);
        assert!(next.last_command_time.is_some());
    }

    #[test]
    fn test_target_to_the_right_moves_right_and_yaws() {
        let cfg = config();
        let (cmd, next) = evaluate(
            Some(&target(420, 200, 150)),
            CENTER,
            &cfg,
            &ControllerState::default(),
            Instant::now(),
        );

        // x error 100 exceeds twice the dead zone, y error -40 sits on the boundary
        assert_eq!(next.last_error_x, 100);
        assert_eq!(next.last_error_y, 0);
        assert!(cmd.lateral > 0);
        assert!(cmd.yaw > 0);
        assert_eq!(cmd.vertical, 0);
        assert_eq!(cmd.longitudinal, 0);
    }

    #[test]
    fn test_dead_zone_boundary_on_lateral_axis() {
        let cfg = proportional_only(1.0);
        let state = ControllerState::default();
        let now = Instant::now();

        let (at_boundary, _) = evaluate(Some(&target(360, 240, 150)), CENTER, &cfg, &state, now);
        let (past_boundary, _) = evaluate(Some(&target(361, 240, 150)), CENTER, &cfg, &state, now);

        assert_eq!(at_boundary.lateral, 0);
        // 41 * 1.0 * softening 0.6 = 24.6
        assert_eq!(past_boundary.lateral, 24);
    }

    #[test]
    fn test_face_below_center_descends() {
        let cfg = proportional_only(0.5);
        let (cmd, _) = evaluate(
            Some(&target(320, 340, 150)),
            CENTER,
            &cfg,
            &ControllerState::default(),
            Instant::now(),
        );
        // y error +100, outside the softening band
        assert_eq!(cmd.vertical, -50);
    }

    #[test]
    fn test_face_too_large_backs_away() {
        let cfg = proportional_only(0.5);
        let (cmd, _) = evaluate(
            Some(&target(320, 240, 250)),
            CENTER,
            &cfg,
            &ControllerState::default(),
            Instant::now(),
        );
        assert_eq!(cmd.longitudinal, -50);
    }

    #[test]
    fn test_size_softening_inside_twice_tolerance() {
        let cfg = proportional_only(1.0);
        let (cmd, _) = evaluate(
            Some(&target(320, 240, 120)),
            CENTER,
            &cfg,
            &ControllerState::default(),
            Instant::now(),
        );
        // size error -30: 30 * 0.8 forward
        assert_eq!(cmd.longitudinal, 24);
    }

    #[test]
    fn test_sign_flip_halves_proportional_output() {
        let cfg = proportional_only(0.4);
        let now = Instant::now();
        let flipped = ControllerState {
            last_error_x: -100,
            last_command_time: Some(now - Duration::from_millis(33)),
            ..ControllerState::default()
        };
        let steady = ControllerState {
            last_error_x: 100,
            ..flipped.clone()
        };

        let (damped, _) = evaluate(Some(&target(420, 240, 150)), CENTER, &cfg, &flipped, now);
        let (undamped, _) = evaluate(Some(&target(420, 240, 150)), CENTER, &cfg, &steady, now);

        assert_eq!(undamped.lateral, 40);
        assert_eq!(damped.lateral, 20);
    }

    #[test]
    fn test_output_is_clamped_to_axis_limits() {
        let cfg = ControlConfig {
            kp_x: 10.0,
            kp_y: 10.0,
            kp_size: 10.0,
            ..config()
        };
        let (cmd, _) = evaluate(
            Some(&target(639, 479, 400)),
            CENTER,
            &cfg,
            &ControllerState::default(),
            Instant::now(),
        );

        assert_eq!(cmd.lateral, cfg.max_speed_horizontal);
        assert_eq!(cmd.vertical, -cfg.max_speed_vertical);
        assert_eq!(cmd.longitudinal, -cfg.max_speed_forward);
        assert_eq!(cmd.yaw, cfg.max_speed_yaw);
    }

    #[test]
    fn test_no_detection_holds_and_counts() {
        let cfg = config();
        let earlier = Instant::now();
        let state = ControllerState {
            last_error_x: 80,
            last_error_y: -60,
            last_error_size: 25,
            last_command_time: Some(earlier),
            frames_without_detection: 4,
        };

        let (cmd, next) = evaluate(None, CENTER, &cfg, &state, Instant::now());

        assert!(cmd.is_hold());
        assert_eq!(next.frames_without_detection, 5);
        assert_eq!(next.last_error_x, 80);
        assert_eq!(next.last_error_y, -60);
        assert_eq!(next.last_error_size, 25);
        assert_eq!(next.last_command_time, Some(earlier));
    }

    #[test]
    fn test_detection_resets_missed_frames() {
        let cfg = config();
        let state = ControllerState {
            frames_without_detection: 12,
            ..ControllerState::default()
        };
        let (_, next) = evaluate(Some(&target(320, 240, 150)), CENTER, &cfg, &state, Instant::now());
        assert_eq!(next.frames_without_detection, 0);
    }

    #[test]
    fn test_same_timestamp_does_not_divide_by_zero() {
        let cfg = config();
        let now = Instant::now();
        let state = ControllerState {
            last_error_x: 60,
            last_command_time: Some(now),
            ..ControllerState::default()
        };

        let (cmd, _) = evaluate(Some(&target(500, 240, 150)), CENTER, &cfg, &state, now);
        assert!(cmd.lateral > 0);
        assert!(cmd.lateral <= cfg.max_speed_horizontal);
    }

    #[test]
    fn test_timestamp_in_future_does_not_divide_by_zero() {
        let cfg = config();
        let now = Instant::now();
        let state = ControllerState {
            last_error_x: 60,
            last_command_time: Some(now + Duration::from_secs(1)),
            ..ControllerState::default()
        };

        let (cmd, _) = evaluate(Some(&target(500, 240, 150)), CENTER, &cfg, &state, now);
        assert!(cmd.lateral > 0);
    }

    #[test]
    fn test_inside_dead_zone_only_derivative_remains() {
        let cfg = ControlConfig {
            kp_x: 5.0,
            kd_x: 0.5,
            ..config()
        };
        let now = Instant::now();
        let state = ControllerState {
            last_error_x: 60,
            last_command_time: Some(now - cfg.nominal_frame_period),
            ..ControllerState::default()
        };

        let (cmd, _) = evaluate(Some(&target(330, 240, 150)), CENTER, &cfg, &state, now);
        // 0.5 * (0 - 60) / ~1.0, no softening because the error was zeroed
        assert!((-31..=-29).contains(&cmd.lateral));
    }

    #[test]
    fn test_frame_center_of_dimensions() {
        assert_eq!(FrameCenter::from_dimensions(640, 480), FrameCenter::new(320, 240));
        assert_eq!(FrameCenter::from_dimensions(961, 721), FrameCenter::new(480, 360));
    }

    #[test]
    fn test_without_climb_keeps_descent() {
        let up = VelocityCommand::new(1, 2, 30, 4);
        let down = VelocityCommand::new(1, 2, -30, 4);
        assert_eq!(up.without_climb(), VelocityCommand::new(1, 2, 0, 4));
        assert_eq!(down.without_climb(), down);
    }

    #[test]
    fn test_extreme_coordinates_stay_clamped() {
        let cfg = config();
        let state = ControllerState {
            last_error_x: -2_000_000_000,
            last_error_y: i32::MAX,
            last_error_size: i32::MIN,
            ..ControllerState::default()
        };
        let huge = TargetDetection {
            center_x: 2_000_000_000,
            center_y: i32::MIN,
            width: i32::MAX,
            height: i32::MAX,
            confidence: 0.9,
        };

        let (cmd, _) = evaluate(Some(&huge), CENTER, &cfg, &state, Instant::now());

        assert_eq!(cmd, cmd.clamped(&cfg));
        assert!(cmd.lateral.abs() <= cfg.max_speed_horizontal);
        assert!(cmd.vertical.abs() <= cfg.max_speed_vertical);
    }

    proptest! {
        #[test]
        fn prop_output_always_within_limits(
            cx in -5000i32..5000,
            cy in -5000i32..5000,
            size in 0i32..2000,
            last_x in -2000i32..2000,
            last_y in -2000i32..2000,
            last_size in -2000i32..2000,
            elapsed_ms in 0u64..5000,
            kp in 0.0f64..50.0,
            kd in 0.0f64..50.0,
        ) {
            let cfg = ControlConfig {
                kp_x: kp, kd_x: kd, kp_y: kp, kd_y: kd, kp_size: kp, kd_size: kd,
                ..ControlConfig::default()
            };
            let now = Instant::now() + Duration::from_secs(10);
            let state = ControllerState {
                last_error_x: last_x,
                last_error_y: last_y,
                last_error_size: last_size,
                last_command_time: Some(now - Duration::from_millis(elapsed_ms)),
                frames_without_detection: 0,
            };

            let (cmd, _) = evaluate(Some(&target(cx, cy, size)), CENTER, &cfg, &state, now);

            prop_assert!(cmd.lateral.abs() <= cfg.max_speed_horizontal);
            prop_assert!(cmd.longitudinal.abs() <= cfg.max_speed_forward);
            prop_assert!(cmd.vertical.abs() <= cfg.max_speed_vertical);
            prop_assert!(cmd.yaw.abs() <= cfg.max_speed_yaw);
        }

        #[test]
        fn prop_clamp_is_idempotent(
            l in any::<i32>(), f in any::<i32>(), v in any::<i32>(), y in any::<i32>(),
        ) {
            let cfg = ControlConfig::default();
            let once = VelocityCommand::new(l, f, v, y).clamped(&cfg);
            prop_assert_eq!(once.clamped(&cfg), once);
        }

        #[test]
        fn prop_dead_zone_is_idempotent(error in any::<i32>(), dead_zone in 0i32..1000) {
            let once = apply_dead_zone(error, dead_zone);
            prop_assert_eq!(apply_dead_zone(once, dead_zone), once);
        }

        #[test]
        fn prop_identical_input_gives_identical_output(
            cx in 0i32..640, cy in 0i32..480, size in 0i32..400,
        ) {
            let cfg = ControlConfig::default();
            let now = Instant::now();
            let state = ControllerState::default();
            let detection = target(cx, cy, size);
            let a = evaluate(Some(&detection), CENTER, &cfg, &state, now);
            let b = evaluate(Some(&detection), CENTER, &cfg, &state, now);
            prop_assert_eq!(a, b);
        }
    }
}
