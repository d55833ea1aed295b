//! Per-axis building blocks of the control law.

use std::time::{Duration, Instant};

/// Proportional multiplier applied when the error changed sign since the
/// previous evaluation.
pub const OSCILLATION_DAMPING: f64 = 0.5;

/// Feedback older than this many nominal periods scales the proportional
/// term down.
pub const STALE_PERIOD_MULTIPLE: f64 = 2.0;

/// Fallback period when the configured nominal period is unusable.
const FALLBACK_PERIOD_SECS: f64 = 1.0 / 30.0;

/// Zero `error` when its magnitude is within the dead zone (inclusive).
pub fn apply_dead_zone(error: i32, dead_zone: i32) -> i32 {
    if error.unsigned_abs() <= dead_zone.max(0) as u32 {
        0
    } else {
        error
    }
}

/// Elapsed-time measurements for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    /// Elapsed seconds actually used (nominal period substituted if invalid).
    pub dt: f64,
    /// `dt` divided by the nominal period.
    pub normalized_dt: f64,
    /// Proportional scale, `1.0` unless feedback is stale.
    pub latency_factor: f64,
}

impl Timing {
    /// Measure the time since `last`, substituting `nominal` whenever the
    /// elapsed time is not in `(0, max_accepted]`.
    pub fn measure(
        last: Option<Instant>,
        now: Instant,
        nominal: Duration,
        max_accepted: Duration,
    ) -> Self {
        let nominal = match nominal.as_secs_f64() {
            n if n > 0.0 => n,
            _ => FALLBACK_PERIOD_SECS,
        };
        let max_accepted = max_accepted.as_secs_f64();

        let dt = last
            .and_then(|t| now.checked_duration_since(t))
            .map(|d| d.as_secs_f64())
            .filter(|&d| d > 0.0 && d <= max_accepted)
            .unwrap_or(nominal);

        let stale_after = STALE_PERIOD_MULTIPLE * nominal;
        let latency_factor = if dt > stale_after { stale_after / dt } else { 1.0 };

        Self {
            dt,
            normalized_dt: dt / nominal,
            latency_factor,
        }
    }

    /// Timing for an evaluation that arrived exactly one nominal period
    /// after the previous one.
    pub fn nominal() -> Self {
        Self {
            dt: FALLBACK_PERIOD_SECS,
            normalized_dt: 1.0,
            latency_factor: 1.0,
        }
    }
}

/// Proportional and derivative contributions for one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisTerms {
    pub proportional: f64,
    pub derivative: f64,
}

impl AxisTerms {
    /// Compute the PD terms for an already dead-zoned error.
    pub fn compute(error: i32, last_error: i32, kp: f64, kd: f64, timing: &Timing) -> Self {
        let dampen = if sign_flipped(error, last_error) {
            OSCILLATION_DAMPING
        } else {
            1.0
        };

        Self {
            proportional: kp * error as f64 * dampen * timing.latency_factor,
            derivative: kd * (error as f64 - last_error as f64) / timing.normalized_dt,
        }
    }

    pub fn total(&self) -> f64 {
        self.proportional + self.derivative
    }
}

fn sign_flipped(error: i32, last_error: i32) -> bool {
    error != 0 && last_error != 0 && error.signum() != last_error.signum()
}
