//! Session factory over the simulator.

use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use super::camera::SimCamera;
use super::detector::SimDetector;
use super::vehicle::{CallLog, SimFaults, SimVehicle};
use super::world::SimWorld;
use crate::detect::{Detector, DetectorError};
use crate::frame::{FrameError, FrameSource, PolledFrameSource, ThreadedFrameSource};
use crate::session::SessionFactory;
use crate::vehicle::{Vehicle, VehicleError};

/// Default simulated camera rate.
pub const DEFAULT_CAMERA_FPS: u32 = 30;

/// Which frame source implementation to put over the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameMode {
    /// Poll a latest-frame pointer and drop repeats.
    #[default]
    Polled,
    /// Read on a dedicated acquisition thread.
    Threaded,
}

impl fmt::Display for FrameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameMode::Polled => write!(f, "polled"),
            FrameMode::Threaded => write!(f, "threaded"),
        }
    }
}

impl FromStr for FrameMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "polled" | "poll" => Ok(FrameMode::Polled),
            "threaded" | "thread" => Ok(FrameMode::Threaded),
            _ => Err(format!("unknown frame mode '{}', expected 'polled' or 'threaded'", s)),
        }
    }
}

/// Builds simulated collaborators that share one world, call log and set of
/// fault switches.
pub struct SimFactory {
    world: SimWorld,
    log: CallLog,
    faults: SimFaults,
    frame_mode: FrameMode,
    camera_fps: u32,
    frame_limit: Option<u64>,
    frozen_camera: bool,
    detector_delay: Duration,
    detector_failure: Option<String>,
    detector_confidence: Option<f32>,
}

impl SimFactory {
    pub fn new(world: SimWorld) -> Self {
        Self {
            world,
            log: CallLog::new(),
            faults: SimFaults::new(),
            frame_mode: FrameMode::default(),
            camera_fps: DEFAULT_CAMERA_FPS,
            frame_limit: None,
            frozen_camera: false,
            detector_delay: Duration::ZERO,
            detector_failure: None,
            detector_confidence: None,
        }
    }

    pub fn with_frame_mode(mut self, mode: FrameMode) -> Self {
        self.frame_mode = mode;
        self
    }

    pub fn with_camera_fps(mut self, fps: u32) -> Self {
        self.camera_fps = fps;
        self
    }

    /// End the video stream after `limit` frames.
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Open a stream that never delivers a frame.
    pub fn with_frozen_camera(mut self) -> Self {
        self.frozen_camera = true;
        self
    }

    /// Make detector loading take `delay`.
    pub fn with_detector_delay(mut self, delay: Duration) -> Self {
        self.detector_delay = delay;
        self
    }

    /// Make detector loading fail.
    pub fn with_detector_failure(mut self, message: impl Into<String>) -> Self {
        self.detector_failure = Some(message.into());
        self
    }

    pub fn with_detector_confidence(mut self, confidence: f32) -> Self {
        self.detector_confidence = Some(confidence);
        self
    }

    pub fn world(&self) -> SimWorld {
        self.world.clone()
    }

    /// Calls made on every vehicle this factory created.
    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn faults(&self) -> SimFaults {
        self.faults.clone()
    }

    pub fn frame_mode(&self) -> FrameMode {
        self.frame_mode
    }

    fn camera(&self) -> SimCamera {
        let mut camera = SimCamera::new(self.world.clone(), self.camera_fps);
        if let Some(limit) = self.frame_limit {
            camera = camera.with_frame_limit(limit);
        }
        if self.frozen_camera {
            camera = camera.frozen();
        }
        camera
    }
}

impl SessionFactory for SimFactory {
    fn load_detector(&self) -> Result<Box<dyn Detector>, DetectorError> {
        if !self.detector_delay.is_zero() {
            thread::sleep(self.detector_delay);
        }
        if let Some(message) = &self.detector_failure {
            return Err(DetectorError::Load(message.clone()));
        }
        let mut detector = SimDetector::new();
        if let Some(confidence) = self.detector_confidence {
            detector = detector.with_confidence(confidence);
        }
        Ok(Box::new(detector))
    }

    fn connect_vehicle(&self) -> Result<Box<dyn Vehicle>, VehicleError> {
        let mut vehicle = SimVehicle::new(self.world.clone())
            .with_log(self.log.clone())
            .with_faults(self.faults.clone());
        vehicle.connect()?;
        Ok(Box::new(vehicle))
    }

    fn open_frame_source(&self, _vehicle: &mut dyn Vehicle) -> Result<Box<dyn FrameSource>, FrameError> {
        let camera = self.camera();
        tracing::debug!(
            mode = %self.frame_mode,
            fps = self.camera_fps,
            "Opening simulated camera"
        );
        match self.frame_mode {
            FrameMode::Polled => Ok(Box::new(PolledFrameSource::new(camera))),
            FrameMode::Threaded => Ok(Box::new(ThreadedFrameSource::spawn(camera)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::VehicleCall;

    #[test]
    fn test_frame_mode_parse_and_display() {
        assert_eq!("polled".parse::<FrameMode>().unwrap(), FrameMode::Polled);
        assert_eq!("THREADED".parse::<FrameMode>().unwrap(), FrameMode::Threaded);
        assert!("fast".parse::<FrameMode>().is_err());
        assert_eq!(FrameMode::Threaded.to_string(), "threaded");
    }

    #[test]
    fn test_vehicles_share_log_and_faults() {
        let factory = SimFactory::new(SimWorld::default());
        factory.faults().set_connect_failure(true);
        assert!(factory.connect_vehicle().is_err());

        factory.faults().clear();
        let mut vehicle = factory.connect_vehicle().unwrap();
        vehicle.takeoff().unwrap();

        assert_eq!(
            factory.log().calls(),
            vec![VehicleCall::Connect, VehicleCall::Connect, VehicleCall::Takeoff]
        );
        assert!(factory.world().is_airborne());
    }

    #[test]
    fn test_detector_failure() {
        let factory = SimFactory::new(SimWorld::default()).with_detector_failure("weights missing");
        assert_eq!(
            factory.load_detector().err(),
            Some(DetectorError::Load("weights missing".into()))
        );
    }

    #[test]
    fn test_threaded_source_delivers_frames() {
        let factory = SimFactory::new(SimWorld::default())
            .with_frame_mode(FrameMode::Threaded)
            .with_camera_fps(100);
        let mut vehicle = factory.connect_vehicle().unwrap();
        let mut source = factory.open_frame_source(&mut *vehicle).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut frame = None;
        while frame.is_none() && std::time::Instant::now() < deadline {
            frame = source.try_get_frame();
            thread::sleep(Duration::from_millis(5));
        }
        assert!(frame.is_some());
        source.stop();
    }
}
