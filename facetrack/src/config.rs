//! Session configuration.
//!
//! A [`SessionConfig`] is captured once when a session starts. The control
//! gains and limits in [`ControlConfig`] may additionally be retuned while a
//! session runs through [`SharedTuning`]; the loop takes one consistent
//! snapshot per cycle.
//!
//! # Configuration file (INI)
//!
//! ```ini
//! [control]
//! kp_x = 0.15
//! kd_x = 0.25
//! dead_zone = 40
//! target_face_size = 150
//!
//! [limits]
//! max_speed_horizontal = 40
//! max_altitude_cm = 300
//!
//! [session]
//! command_interval = 3
//! first_frame_timeout_ms = 5000
//!
//! [safety]
//! low_battery_percent = 20
//! lost_target = hover
//! ```
//!
//! Missing keys keep their defaults. Every key is listed by
//! [`ConfigKey::all`].

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use ini::Ini;
use parking_lot::RwLock;
use thiserror::Error;

use crate::supervisor::LostTargetPolicy;
use crate::throttle::DEFAULT_COMMAND_INTERVAL;

/// Default horizontal gains.
pub const DEFAULT_KP_X: f64 = 0.15;
pub const DEFAULT_KD_X: f64 = 0.25;

/// Default vertical gains.
pub const DEFAULT_KP_Y: f64 = 0.12;
pub const DEFAULT_KD_Y: f64 = 0.20;

/// Default distance gains.
pub const DEFAULT_KP_SIZE: f64 = 0.25;
pub const DEFAULT_KD_SIZE: f64 = 0.10;

/// Default dead zone around the frame centre (pixels).
pub const DEFAULT_DEAD_ZONE: i32 = 40;

/// Default apparent face size to hold (pixels).
pub const DEFAULT_TARGET_FACE_SIZE: i32 = 150;

/// Default dead zone around the target size (pixels).
pub const DEFAULT_FACE_SIZE_TOLERANCE: i32 = 20;

/// Default axis limits (cm/s, yaw in deg/s).
pub const DEFAULT_MAX_SPEED_HORIZONTAL: i32 = 40;
pub const DEFAULT_MAX_SPEED_FORWARD: i32 = 50;
pub const DEFAULT_MAX_SPEED_VERTICAL: i32 = 30;
pub const DEFAULT_MAX_SPEED_YAW: i32 = 30;

/// Largest magnitude the vehicle accepts on any axis.
pub const MAX_AXIS_SPEED: i32 = 100;

/// Default minimum detector confidence.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;

/// Default nominal frame period (30 fps).
pub const DEFAULT_NOMINAL_FRAME_PERIOD: Duration = Duration::from_nanos(33_333_333);

/// Elapsed times above this are treated as stale.
pub const DEFAULT_MAX_ACCEPTED_DT: Duration = Duration::from_millis(500);

/// Default altitude ceiling (cm).
pub const DEFAULT_MAX_ALTITUDE_CM: i32 = 300;

/// Battery thresholds (percent).
pub const DEFAULT_LOW_BATTERY_PERCENT: u8 = 20;
pub const DEFAULT_CRITICAL_BATTERY_PERCENT: u8 = 10;

/// Lifecycle timings.
pub const DEFAULT_TAKEOFF_SETTLE: Duration = Duration::from_secs(3);
pub const DEFAULT_LANDING_SETTLE: Duration = Duration::from_secs(1);
pub const DEFAULT_EMERGENCY_SETTLE: Duration = Duration::from_millis(500);
pub const DEFAULT_FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_TELEMETRY_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_millis(10);

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown configuration key '{0}'")]
    UnknownKey(String),

    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Gains, dead zones and limits of the control law.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlConfig {
    pub kp_x: f64,
    pub kd_x: f64,
    pub kp_y: f64,
    pub kd_y: f64,
    pub kp_size: f64,
    pub kd_size: f64,

    /// Pixels around the frame centre treated as "centred" (inclusive).
    pub dead_zone: i32,

    /// Apparent face size (mean of box width and height) to hold.
    pub target_face_size: i32,

    /// Pixels around `target_face_size` treated as "at distance" (inclusive).
    pub face_size_tolerance: i32,

    pub max_speed_horizontal: i32,
    pub max_speed_forward: i32,
    pub max_speed_vertical: i32,
    pub max_speed_yaw: i32,

    /// Expected time between processed frames.
    pub nominal_frame_period: Duration,

    /// Longest elapsed time still trusted for the derivative term.
    pub max_accepted_dt: Duration,

    /// Detections below this confidence are ignored.
    pub confidence_threshold: f32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            kp_x: DEFAULT_KP_X,
            kd_x: DEFAULT_KD_X,
            kp_y: DEFAULT_KP_Y,
            kd_y: DEFAULT_KD_Y,
            kp_size: DEFAULT_KP_SIZE,
            kd_size: DEFAULT_KD_SIZE,
            dead_zone: DEFAULT_DEAD_ZONE,
            target_face_size: DEFAULT_TARGET_FACE_SIZE,
            face_size_tolerance: DEFAULT_FACE_SIZE_TOLERANCE,
            max_speed_horizontal: DEFAULT_MAX_SPEED_HORIZONTAL,
            max_speed_forward: DEFAULT_MAX_SPEED_FORWARD,
            max_speed_vertical: DEFAULT_MAX_SPEED_VERTICAL,
            max_speed_yaw: DEFAULT_MAX_SPEED_YAW,
            nominal_frame_period: DEFAULT_NOMINAL_FRAME_PERIOD,
            max_accepted_dt: DEFAULT_MAX_ACCEPTED_DT,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

impl ControlConfig {
    /// Check gains, dead zones and limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let gains = [
            ("kp_x", self.kp_x),
            ("kd_x", self.kd_x),
            ("kp_y", self.kp_y),
            ("kd_y", self.kd_y),
            ("kp_size", self.kp_size),
            ("kd_size", self.kd_size),
        ];
        for (name, gain) in gains {
            if !gain.is_finite() || gain < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a non-negative number, got {}",
                    name, gain
                )));
            }
        }

        if self.dead_zone < 0 || self.face_size_tolerance < 0 {
            return Err(ConfigError::Invalid("dead zones must not be negative".into()));
        }
        if self.target_face_size <= 0 {
            return Err(ConfigError::Invalid("target_face_size must be positive".into()));
        }

        let limits = [
            ("max_speed_horizontal", self.max_speed_horizontal),
            ("max_speed_forward", self.max_speed_forward),
            ("max_speed_vertical", self.max_speed_vertical),
            ("max_speed_yaw", self.max_speed_yaw),
        ];
        for (name, limit) in limits {
            if !(0..=MAX_AXIS_SPEED).contains(&limit) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be within 0..={}, got {}",
                    name, MAX_AXIS_SPEED, limit
                )));
            }
        }

        if self.nominal_frame_period.is_zero() {
            return Err(ConfigError::Invalid("nominal_frame_period must be positive".into()));
        }
        if self.max_accepted_dt < self.nominal_frame_period {
            return Err(ConfigError::Invalid(
                "max_accepted_dt must not be shorter than nominal_frame_period".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(
                "confidence_threshold must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Altitude, battery and target-loss limits.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyConfig {
    /// Climb is blocked at or above this height.
    pub max_altitude_cm: i32,

    /// Below this a warning is logged.
    pub low_battery_percent: u8,

    /// Below this an airborne vehicle is landed.
    pub critical_battery_percent: u8,

    /// What to do while the target is missing.
    pub lost_target: LostTargetPolicy,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_altitude_cm: DEFAULT_MAX_ALTITUDE_CM,
            low_battery_percent: DEFAULT_LOW_BATTERY_PERCENT,
            critical_battery_percent: DEFAULT_CRITICAL_BATTERY_PERCENT,
            lost_target: LostTargetPolicy::default(),
        }
    }
}

/// Everything a session needs, captured at start.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub control: ControlConfig,
    pub safety: SafetyConfig,

    /// Processed cycles per forwarded velocity command.
    pub command_interval: u32,

    /// Idle delay between loop iterations.
    pub loop_interval: Duration,

    /// How long initialization waits for the first frame.
    pub first_frame_timeout: Duration,

    /// How long `stop` waits for the session thread.
    pub stop_timeout: Duration,

    /// Motion hold after takeoff.
    pub takeoff_settle: Duration,

    /// Pause between the final zero command and `land` on a normal stop.
    pub landing_settle: Duration,

    /// Pause between the zero command and `land` on an emergency stop.
    pub emergency_settle: Duration,

    /// How often the battery level is polled.
    pub telemetry_poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            safety: SafetyConfig::default(),
            command_interval: DEFAULT_COMMAND_INTERVAL,
            loop_interval: DEFAULT_LOOP_INTERVAL,
            first_frame_timeout: DEFAULT_FIRST_FRAME_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            takeoff_settle: DEFAULT_TAKEOFF_SETTLE,
            landing_settle: DEFAULT_LANDING_SETTLE,
            emergency_settle: DEFAULT_EMERGENCY_SETTLE,
            telemetry_poll_interval: DEFAULT_TELEMETRY_POLL_INTERVAL,
        }
    }
}

impl SessionConfig {
    /// Check every value. Called by the session before anything is acquired.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.control.validate()?;

        if self.command_interval == 0 {
            return Err(ConfigError::Invalid("command_interval must be at least 1".into()));
        }
        if self.safety.max_altitude_cm <= 0 {
            return Err(ConfigError::Invalid("max_altitude_cm must be positive".into()));
        }
        if self.safety.low_battery_percent > 100
            || self.safety.critical_battery_percent > self.safety.low_battery_percent
        {
            return Err(ConfigError::Invalid(
                "battery thresholds must satisfy critical <= low <= 100".into(),
            ));
        }

        let periods = [
            ("loop_interval", self.loop_interval),
            ("first_frame_timeout", self.first_frame_timeout),
            ("stop_timeout", self.stop_timeout),
            ("telemetry_poll_interval", self.telemetry_poll_interval),
        ];
        for (name, period) in periods {
            if period.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    /// Load from an INI file. Keys absent from the file keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| match e {
            ini::Error::Io(source) => ConfigError::Read {
                path: path.to_path_buf(),
                source,
            },
            ini::Error::Parse(err) => ConfigError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            },
        })?;

        let config = Self::from_ini(&ini)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Build from parsed INI content.
    pub fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for key in ConfigKey::all() {
            if let Some(value) = ini.get_from(Some(key.section()), key.key_name()) {
                key.set(&mut config, value)?;
            }
        }
        Ok(config)
    }

    /// Render every key as INI content.
    pub fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        for key in ConfigKey::all() {
            ini.with_section(Some(key.section()))
                .set(key.key_name(), key.get(self));
        }
        ini
    }

    /// Write every key to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        self.to_ini().write_to_file(path).map_err(write_err)?;
        tracing::debug!(path = %path.display(), "Saved configuration");
        Ok(())
    }
}

/// Default location of the configuration file.
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facetrack")
        .join("config.ini")
}

/// Runtime-tunable control parameters shared between the session thread and
/// its controller.
#[derive(Debug, Clone)]
pub struct SharedTuning {
    inner: Arc<RwLock<ControlConfig>>,
}

impl SharedTuning {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// A consistent copy of the current parameters.
    pub fn snapshot(&self) -> ControlConfig {
        self.inner.read().clone()
    }

    /// Modify the parameters. The change is applied only if the result
    /// validates.
    pub fn update<F>(&self, apply: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut ControlConfig),
    {
        let mut guard = self.inner.write();
        let mut candidate = guard.clone();
        apply(&mut candidate);
        candidate.validate()?;
        *guard = candidate;
        tracing::info!("Control parameters updated");
        Ok(())
    }
}

/// Every configurable setting, addressed as `section.key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    ControlKpX,
    ControlKdX,
    ControlKpY,
    ControlKdY,
    ControlKpSize,
    ControlKdSize,
    ControlDeadZone,
    ControlTargetFaceSize,
    ControlFaceSizeTolerance,
    ControlConfidenceThreshold,
    ControlNominalFramePeriodMs,
    ControlMaxAcceptedDtMs,
    LimitsMaxSpeedHorizontal,
    LimitsMaxSpeedForward,
    LimitsMaxSpeedVertical,
    LimitsMaxSpeedYaw,
    LimitsMaxAltitudeCm,
    SessionCommandInterval,
    SessionLoopIntervalMs,
    SessionFirstFrameTimeoutMs,
    SessionStopTimeoutMs,
    SessionTakeoffSettleMs,
    SessionLandingSettleMs,
    SessionEmergencySettleMs,
    SessionTelemetryPollMs,
    SafetyLowBatteryPercent,
    SafetyCriticalBatteryPercent,
    SafetyLostTarget,
}

impl ConfigKey {
    /// All keys in file order.
    pub fn all() -> &'static [ConfigKey] {
        use ConfigKey::*;
        &[
            ControlKpX,
            ControlKdX,
            ControlKpY,
            ControlKdY,
            ControlKpSize,
            ControlKdSize,
            ControlDeadZone,
            ControlTargetFaceSize,
            ControlFaceSizeTolerance,
            ControlConfidenceThreshold,
            ControlNominalFramePeriodMs,
            ControlMaxAcceptedDtMs,
            LimitsMaxSpeedHorizontal,
            LimitsMaxSpeedForward,
            LimitsMaxSpeedVertical,
            LimitsMaxSpeedYaw,
            LimitsMaxAltitudeCm,
            SessionCommandInterval,
            SessionLoopIntervalMs,
            SessionFirstFrameTimeoutMs,
            SessionStopTimeoutMs,
            SessionTakeoffSettleMs,
            SessionLandingSettleMs,
            SessionEmergencySettleMs,
            SessionTelemetryPollMs,
            SafetyLowBatteryPercent,
            SafetyCriticalBatteryPercent,
            SafetyLostTarget,
        ]
    }

    /// INI section.
    pub fn section(&self) -> &'static str {
        use ConfigKey::*;
        match self {
            ControlKpX | ControlKdX | ControlKpY | ControlKdY | ControlKpSize | ControlKdSize
            | ControlDeadZone | ControlTargetFaceSize | ControlFaceSizeTolerance
            | ControlConfidenceThreshold | ControlNominalFramePeriodMs | ControlMaxAcceptedDtMs => {
                "control"
            }
            LimitsMaxSpeedHorizontal | LimitsMaxSpeedForward | LimitsMaxSpeedVertical
            | LimitsMaxSpeedYaw | LimitsMaxAltitudeCm => "limits",
            SessionCommandInterval | SessionLoopIntervalMs | SessionFirstFrameTimeoutMs
            | SessionStopTimeoutMs | SessionTakeoffSettleMs | SessionLandingSettleMs
            | SessionEmergencySettleMs | SessionTelemetryPollMs => "session",
            SafetyLowBatteryPercent | SafetyCriticalBatteryPercent | SafetyLostTarget => "safety",
        }
    }

    /// Key within its section.
    pub fn key_name(&self) -> &'static str {
        use ConfigKey::*;
        match self {
            ControlKpX => "kp_x",
            ControlKdX => "kd_x",
            ControlKpY => "kp_y",
            ControlKdY => "kd_y",
            ControlKpSize => "kp_size",
            ControlKdSize => "kd_size",
            ControlDeadZone => "dead_zone",
            ControlTargetFaceSize => "target_face_size",
            ControlFaceSizeTolerance => "face_size_tolerance",
            ControlConfidenceThreshold => "confidence_threshold",
            ControlNominalFramePeriodMs => "nominal_frame_period_ms",
            ControlMaxAcceptedDtMs => "max_accepted_dt_ms",
            LimitsMaxSpeedHorizontal => "max_speed_horizontal",
            LimitsMaxSpeedForward => "max_speed_forward",
            LimitsMaxSpeedVertical => "max_speed_vertical",
            LimitsMaxSpeedYaw => "max_speed_yaw",
            LimitsMaxAltitudeCm => "max_altitude_cm",
            SessionCommandInterval => "command_interval",
            SessionLoopIntervalMs => "loop_interval_ms",
            SessionFirstFrameTimeoutMs => "first_frame_timeout_ms",
            SessionStopTimeoutMs => "stop_timeout_ms",
            SessionTakeoffSettleMs => "takeoff_settle_ms",
            SessionLandingSettleMs => "landing_settle_ms",
            SessionEmergencySettleMs => "emergency_settle_ms",
            SessionTelemetryPollMs => "telemetry_poll_ms",
            SafetyLowBatteryPercent => "low_battery_percent",
            SafetyCriticalBatteryPercent => "critical_battery_percent",
            SafetyLostTarget => "lost_target",
        }
    }

    /// Full `section.key` name.
    pub fn name(&self) -> String {
        format!("{}.{}", self.section(), self.key_name())
    }

    /// Current value rendered as it would appear in the file.
    pub fn get(&self, config: &SessionConfig) -> String {
        use ConfigKey::*;
        let c = &config.control;
        match self {
            ControlKpX => c.kp_x.to_string(),
            ControlKdX => c.kd_x.to_string(),
            ControlKpY => c.kp_y.to_string(),
            ControlKdY => c.kd_y.to_string(),
            ControlKpSize => c.kp_size.to_string(),
            ControlKdSize => c.kd_size.to_string(),
            ControlDeadZone => c.dead_zone.to_string(),
            ControlTargetFaceSize => c.target_face_size.to_string(),
            ControlFaceSizeTolerance => c.face_size_tolerance.to_string(),
            ControlConfidenceThreshold => c.confidence_threshold.to_string(),
            ControlNominalFramePeriodMs => fractional_millis(c.nominal_frame_period),
            ControlMaxAcceptedDtMs => fractional_millis(c.max_accepted_dt),
            LimitsMaxSpeedHorizontal => c.max_speed_horizontal.to_string(),
            LimitsMaxSpeedForward => c.max_speed_forward.to_string(),
            LimitsMaxSpeedVertical => c.max_speed_vertical.to_string(),
            LimitsMaxSpeedYaw => c.max_speed_yaw.to_string(),
            LimitsMaxAltitudeCm => config.safety.max_altitude_cm.to_string(),
            SessionCommandInterval => config.command_interval.to_string(),
            SessionLoopIntervalMs => config.loop_interval.as_millis().to_string(),
            SessionFirstFrameTimeoutMs => config.first_frame_timeout.as_millis().to_string(),
            SessionStopTimeoutMs => config.stop_timeout.as_millis().to_string(),
            SessionTakeoffSettleMs => config.takeoff_settle.as_millis().to_string(),
            SessionLandingSettleMs => config.landing_settle.as_millis().to_string(),
            SessionEmergencySettleMs => config.emergency_settle.as_millis().to_string(),
            SessionTelemetryPollMs => config.telemetry_poll_interval.as_millis().to_string(),
            SafetyLowBatteryPercent => config.safety.low_battery_percent.to_string(),
            SafetyCriticalBatteryPercent => config.safety.critical_battery_percent.to_string(),
            SafetyLostTarget => config.safety.lost_target.to_string(),
        }
    }

    /// Parse `value` and store it. Only the syntax is checked here; call
    /// [`SessionConfig::validate`] for cross-field rules.
    pub fn set(&self, config: &mut SessionConfig, value: &str) -> Result<(), ConfigError> {
        use ConfigKey::*;
        let c = &mut config.control;
        match self {
            ControlKpX => c.kp_x = self.parse(value)?,
            ControlKdX => c.kd_x = self.parse(value)?,
            ControlKpY => c.kp_y = self.parse(value)?,
            ControlKdY => c.kd_y = self.parse(value)?,
            ControlKpSize => c.kp_size = self.parse(value)?,
            ControlKdSize => c.kd_size = self.parse(value)?,
            ControlDeadZone => c.dead_zone = self.parse(value)?,
            ControlTargetFaceSize => c.target_face_size = self.parse(value)?,
            ControlFaceSizeTolerance => c.face_size_tolerance = self.parse(value)?,
            ControlConfidenceThreshold => c.confidence_threshold = self.parse(value)?,
            ControlNominalFramePeriodMs => c.nominal_frame_period = self.parse_fractional_millis(value)?,
            ControlMaxAcceptedDtMs => c.max_accepted_dt = self.parse_fractional_millis(value)?,
            LimitsMaxSpeedHorizontal => c.max_speed_horizontal = self.parse(value)?,
            LimitsMaxSpeedForward => c.max_speed_forward = self.parse(value)?,
            LimitsMaxSpeedVertical => c.max_speed_vertical = self.parse(value)?,
            LimitsMaxSpeedYaw => c.max_speed_yaw = self.parse(value)?,
            LimitsMaxAltitudeCm => config.safety.max_altitude_cm = self.parse(value)?,
            SessionCommandInterval => config.command_interval = self.parse(value)?,
            SessionLoopIntervalMs => config.loop_interval = self.parse_millis(value)?,
            SessionFirstFrameTimeoutMs => config.first_frame_timeout = self.parse_millis(value)?,
            SessionStopTimeoutMs => config.stop_timeout = self.parse_millis(value)?,
            SessionTakeoffSettleMs => config.takeoff_settle = self.parse_millis(value)?,
            SessionLandingSettleMs => config.landing_settle = self.parse_millis(value)?,
            SessionEmergencySettleMs => config.emergency_settle = self.parse_millis(value)?,
            SessionTelemetryPollMs => config.telemetry_poll_interval = self.parse_millis(value)?,
            SafetyLowBatteryPercent => config.safety.low_battery_percent = self.parse(value)?,
            SafetyCriticalBatteryPercent => {
                config.safety.critical_battery_percent = self.parse(value)?
            }
            SafetyLostTarget => {
                config.safety.lost_target = value
                    .parse()
                    .map_err(|reason| self.invalid(value, reason))?
            }
        }
        Ok(())
    }

    fn invalid(&self, value: &str, reason: impl ToString) -> ConfigError {
        ConfigError::InvalidValue {
            key: self.name(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    fn parse<T>(&self, value: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        value.trim().parse().map_err(|e| self.invalid(value, e))
    }

    fn parse_millis(&self, value: &str) -> Result<Duration, ConfigError> {
        self.parse::<u64>(value).map(Duration::from_millis)
    }

    fn parse_fractional_millis(&self, value: &str) -> Result<Duration, ConfigError> {
        let ms: f64 = self.parse(value)?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(self.invalid(value, "expected a non-negative number of milliseconds"));
        }
        Duration::try_from_secs_f64(ms / 1000.0).map_err(|e| self.invalid(value, e))
    }
}

fn fractional_millis(duration: Duration) -> String {
    let ms = duration.as_secs_f64() * 1000.0;
    if ms.fract() == 0.0 {
        format!("{}", ms as u64)
    } else {
        format!("{:.3}", ms)
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        ConfigKey::all()
            .iter()
            .copied()
            .find(|key| key.name() == wanted)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.section(), self.key_name())
    }
}
