//! Shared simulated world.

use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use image::{Rgb, RgbImage};
use parking_lot::Mutex;

use crate::control::VelocityCommand;

/// Colour of the rendered face marker.
pub const MARKER: Rgb<u8> = Rgb([255, 0, 255]);

const BACKGROUND: Rgb<u8> = Rgb([36, 52, 40]);

/// Smallest and largest rendered marker side, in pixels.
const MIN_TARGET_SIZE: f64 = 8.0;

/// Battery drain on the ground relative to flight.
const GROUND_DRAIN_FACTOR: f64 = 0.2;

/// Static parameters of a simulated world.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Rendered frame width in pixels.
    pub width: u32,
    /// Rendered frame height in pixels.
    pub height: u32,

    /// Initial target centre and side length, in pixels.
    pub target_x: f64,
    pub target_y: f64,
    pub target_size: f64,

    /// Image shift per centimetre of lateral or vertical travel.
    pub px_per_cm: f64,
    /// Image shift per degree of yaw.
    pub px_per_degree: f64,
    /// Change in apparent size per centimetre of longitudinal travel.
    pub size_per_cm: f64,

    /// Horizontal wander of the target, in pixels. Zero keeps it still.
    pub wander_amplitude: f64,
    pub wander_period: Duration,

    /// Battery at start, in percent.
    pub initial_battery: f64,
    /// Battery drain per second of flight, in percent.
    pub battery_drain_per_sec: f64,

    /// Altitude reached by a takeoff.
    pub takeoff_altitude_cm: f64,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            target_x: 320.0,
            target_y: 240.0,
            target_size: 150.0,
            px_per_cm: 2.0,
            px_per_degree: 4.0,
            size_per_cm: 0.8,
            wander_amplitude: 0.0,
            wander_period: Duration::from_secs(8),
            initial_battery: 90.0,
            battery_drain_per_sec: 0.05,
            takeoff_altitude_cm: 80.0,
        }
    }
}

/// Where the target currently appears in the image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetPose {
    pub x: f64,
    pub y: f64,
    pub size: f64,
}

#[derive(Debug)]
struct WorldState {
    config: WorldConfig,
    target: TargetPose,
    visible: bool,
    airborne: bool,
    altitude_cm: f64,
    battery: f64,
    velocity: VelocityCommand,
    elapsed: Duration,
    tick: u64,
}

impl WorldState {
    fn new(config: WorldConfig) -> Self {
        let target = TargetPose {
            x: config.target_x,
            y: config.target_y,
            size: config.target_size,
        };
        let battery = config.initial_battery;
        Self {
            config,
            target,
            visible: true,
            airborne: false,
            altitude_cm: 0.0,
            battery,
            velocity: VelocityCommand::HOLD,
            elapsed: Duration::ZERO,
            tick: 0,
        }
    }

    fn wander_offset(&self) -> f64 {
        let period = self.config.wander_period.as_secs_f64();
        if self.config.wander_amplitude == 0.0 || period <= 0.0 {
            return 0.0;
        }
        self.config.wander_amplitude * (TAU * self.elapsed.as_secs_f64() / period).sin()
    }

    fn apparent_target(&self) -> TargetPose {
        TargetPose {
            x: self.target.x + self.wander_offset(),
            ..self.target
        }
    }
}

/// The simulated scene, shared between vehicle, camera and tests.
///
/// Cloning is cheap; all clones see the same world.
#[derive(Debug, Clone)]
pub struct SimWorld {
    inner: Arc<Mutex<WorldState>>,
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new(WorldConfig::default())
    }
}

impl SimWorld {
    pub fn new(config: WorldConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WorldState::new(config))),
        }
    }

    pub fn config(&self) -> WorldConfig {
        self.inner.lock().config.clone()
    }

    /// Frame dimensions.
    pub fn dimensions(&self) -> (u32, u32) {
        let state = self.inner.lock();
        (state.config.width, state.config.height)
    }

    /// Move simulated time forward by `dt`.
    ///
    /// While airborne the commanded velocity moves the target in the image:
    /// flying right or yawing clockwise shifts it left, climbing shifts it
    /// down, flying forward makes it larger.
    pub fn advance(&self, dt: Duration) {
        let mut state = self.inner.lock();
        let secs = dt.as_secs_f64();
        state.elapsed += dt;
        state.tick = state.tick.wrapping_add(1);

        let drain = state.config.battery_drain_per_sec * secs;
        let drain = if state.airborne { drain } else { drain * GROUND_DRAIN_FACTOR };
        state.battery = (state.battery - drain).max(0.0);

        if !state.airborne {
            return;
        }

        let v = state.velocity;
        let config = &state.config;
        let dx = -(v.lateral as f64) * config.px_per_cm - v.yaw as f64 * config.px_per_degree;
        let dy = v.vertical as f64 * config.px_per_cm;
        let ds = v.longitudinal as f64 * config.size_per_cm;
        let (width, height) = (config.width as f64, config.height as f64);

        let target = &mut state.target;
        target.x = (target.x + dx * secs).clamp(0.0, width);
        target.y = (target.y + dy * secs).clamp(0.0, height);
        target.size = (target.size + ds * secs).clamp(MIN_TARGET_SIZE, width.min(height));

        state.altitude_cm = (state.altitude_cm + v.vertical as f64 * secs).max(0.0);
    }

    /// Render the current scene.
    ///
    /// Pixel `(0, 0)` carries a frame counter so consecutive renders of a
    /// still scene still differ.
    pub fn render(&self) -> RgbImage {
        let state = self.inner.lock();
        let (width, height) = (state.config.width, state.config.height);
        let mut image = RgbImage::from_pixel(width, height, BACKGROUND);

        if state.visible {
            let pose = state.apparent_target();
            let half = pose.size / 2.0;
            let x0 = (pose.x - half).round().max(0.0) as u32;
            let y0 = (pose.y - half).round().max(0.0) as u32;
            let x1 = ((pose.x + half).round().max(0.0) as u32).min(width);
            let y1 = ((pose.y + half).round().max(0.0) as u32).min(height);
            for y in y0..y1 {
                for x in x0..x1 {
                    image.put_pixel(x, y, MARKER);
                }
            }
        }

        if width > 0 && height > 0 {
            let tick = state.tick;
            image.put_pixel(0, 0, Rgb([tick as u8, (tick >> 8) as u8, 0]));
        }
        image
    }

    /// Where the target appears now, wander included.
    pub fn target(&self) -> TargetPose {
        self.inner.lock().apparent_target()
    }

    /// Offset of the target from the frame centre in pixels.
    pub fn target_offset(&self) -> (f64, f64) {
        let state = self.inner.lock();
        let pose = state.apparent_target();
        (
            pose.x - state.config.width as f64 / 2.0,
            pose.y - state.config.height as f64 / 2.0,
        )
    }

    pub fn set_target(&self, x: f64, y: f64, size: f64) {
        self.inner.lock().target = TargetPose { x, y, size };
    }

    pub fn hide_target(&self) {
        self.inner.lock().visible = false;
    }

    pub fn show_target(&self) {
        self.inner.lock().visible = true;
    }

    pub fn is_target_visible(&self) -> bool {
        self.inner.lock().visible
    }

    pub fn is_airborne(&self) -> bool {
        self.inner.lock().airborne
    }

    pub fn altitude_cm(&self) -> i32 {
        self.inner.lock().altitude_cm.round() as i32
    }

    pub fn battery_percent(&self) -> u8 {
        self.inner.lock().battery.clamp(0.0, 100.0).round() as u8
    }

    pub fn set_battery(&self, percent: u8) {
        self.inner.lock().battery = percent as f64;
    }

    /// The velocity currently applied while airborne.
    pub fn velocity(&self) -> VelocityCommand {
        self.inner.lock().velocity
    }

    /// Simulated time since creation.
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().elapsed
    }

    pub(crate) fn take_off(&self) {
        let mut state = self.inner.lock();
        state.airborne = true;
        state.altitude_cm = state.altitude_cm.max(state.config.takeoff_altitude_cm);
        state.velocity = VelocityCommand::HOLD;
    }

    pub(crate) fn land(&self) {
        let mut state = self.inner.lock();
        state.airborne = false;
        state.altitude_cm = 0.0;
        state.velocity = VelocityCommand::HOLD;
    }

    pub(crate) fn set_velocity(&self, command: VelocityCommand) {
        self.inner.lock().velocity = command;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flying() -> SimWorld {
        let world = SimWorld::default();
        world.take_off();
        world
    }

    #[test]
    fn test_grounded_vehicle_does_not_move_target() {
        let world = SimWorld::default();
        world.set_velocity(VelocityCommand::new(30, 0, 0, 0));
        world.advance(Duration::from_secs(1));
        assert_eq!(world.target_offset(), (0.0, 0.0));
    }

    #[test]
    fn test_flying_right_moves_target_left() {
        let world = flying();
        world.set_velocity(VelocityCommand::new(10, 0, 0, 0));
        world.advance(Duration::from_secs(1));
        let (dx, dy) = world.target_offset();
        assert!((dx + 20.0).abs() < 1e-9);
        assert_eq!(dy, 0.0);
    }

    #[test]
    fn test_climbing_moves_target_down_and_raises_altitude() {
        let world = flying();
        let start = world.altitude_cm();
        world.set_velocity(VelocityCommand::new(0, 0, 20, 0));
        world.advance(Duration::from_millis(500));
        assert!(world.target_offset().1 > 0.0);
        assert_eq!(world.altitude_cm(), start + 10);
    }

    #[test]
    fn test_forward_grows_target() {
        let world = flying();
        world.set_velocity(VelocityCommand::new(0, 25, 0, 0));
        world.advance(Duration::from_secs(1));
        assert!(world.target().size > 150.0);
    }

    #[test]
    fn test_render_draws_marker_and_varies_per_tick() {
        let world = SimWorld::default();
        let first = world.render();
        assert_eq!(*first.get_pixel(320, 240), MARKER);
        assert_ne!(*first.get_pixel(10, 10), MARKER);

        world.advance(Duration::from_millis(33));
        let second = world.render();
        assert_ne!(first.as_raw(), second.as_raw());
    }

    #[test]
    fn test_hidden_target_is_not_rendered() {
        let world = SimWorld::default();
        world.hide_target();
        let image = world.render();
        assert!(image.pixels().all(|p| *p != MARKER));
    }

    #[test]
    fn test_battery_drains_faster_in_flight() {
        let config = WorldConfig {
            battery_drain_per_sec: 10.0,
            ..WorldConfig::default()
        };
        let world = SimWorld::new(config);
        world.advance(Duration::from_secs(1));
        assert_eq!(world.battery_percent(), 88);

        world.take_off();
        world.advance(Duration::from_secs(1));
        assert_eq!(world.battery_percent(), 78);
    }

    #[test]
    fn test_wander_is_periodic() {
        let config = WorldConfig {
            wander_amplitude: 50.0,
            wander_period: Duration::from_secs(4),
            ..WorldConfig::default()
        };
        let world = SimWorld::new(config);
        world.advance(Duration::from_secs(1));
        assert!((world.target_offset().0 - 50.0).abs() < 1e-6);
        world.advance(Duration::from_secs(3));
        assert!(world.target_offset().0.abs() < 1e-6);
    }
}
