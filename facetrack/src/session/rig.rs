//! Resources owned by a running session.

use crate::control::VelocityCommand;
use crate::detect::{detect_target, Detector, DetectorError, TargetDetection};
use crate::frame::{Frame, FrameSource};
use crate::vehicle::{Vehicle, VehicleError};

/// The detector, vehicle link and frame source of one session.
///
/// Each resource is attached as soon as it is acquired, so a failure or
/// cancellation part-way through initialization still releases whatever was
/// acquired. [`release`](Rig::release) is idempotent and also runs on drop.
#[derive(Default)]
pub struct Rig {
    detector: Option<Box<dyn Detector>>,
    vehicle: Option<Box<dyn Vehicle>>,
    frames: Option<Box<dyn FrameSource>>,
}

impl Rig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_detector(&mut self, detector: Box<dyn Detector>) {
        self.detector = Some(detector);
    }

    pub fn attach_vehicle(&mut self, vehicle: Box<dyn Vehicle>) {
        self.vehicle = Some(vehicle);
    }

    pub fn attach_frames(&mut self, frames: Box<dyn FrameSource>) {
        self.frames = Some(frames);
    }

    /// The vehicle link, if connected.
    pub fn vehicle_mut(&mut self) -> Option<&mut (dyn Vehicle + 'static)> {
        self.vehicle.as_deref_mut()
    }

    pub fn send_velocity(&mut self, command: VelocityCommand) -> Result<(), VehicleError> {
        self.vehicle
            .as_mut()
            .ok_or(VehicleError::NotConnected)?
            .set_velocity(command)
    }

    pub fn takeoff(&mut self) -> Result<(), VehicleError> {
        self.vehicle.as_mut().ok_or(VehicleError::NotConnected)?.takeoff()
    }

    pub fn land(&mut self) -> Result<(), VehicleError> {
        self.vehicle.as_mut().ok_or(VehicleError::NotConnected)?.land()
    }

    pub fn altitude_cm(&mut self) -> Result<i32, VehicleError> {
        self.vehicle
            .as_mut()
            .ok_or(VehicleError::NotConnected)?
            .altitude_cm()
    }

    pub fn battery_percent(&mut self) -> Result<u8, VehicleError> {
        self.vehicle
            .as_mut()
            .ok_or(VehicleError::NotConnected)?
            .battery_percent()
    }

    /// The newest frame, if one arrived since the last call.
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.frames.as_mut()?.try_get_frame()
    }

    /// Whether the frame source has ended for good.
    pub fn frames_exhausted(&self) -> bool {
        self.frames.as_ref().map_or(true, |frames| frames.is_exhausted())
    }

    /// Run the detector on `frame` and keep the largest confident target.
    pub fn detect(
        &mut self,
        frame: &Frame,
        min_confidence: f32,
    ) -> Result<Option<TargetDetection>, DetectorError> {
        match self.detector.as_mut() {
            Some(detector) => detect_target(detector, frame, min_confidence),
            None => Ok(None),
        }
    }

    /// Stop the frame source, disconnect the vehicle and drop the detector.
    ///
    /// Resources already released are skipped, so calling this again has no
    /// further effect.
    pub fn release(&mut self) {
        if let Some(mut frames) = self.frames.take() {
            frames.stop();
            tracing::debug!("Frame source released");
        }
        if let Some(mut vehicle) = self.vehicle.take() {
            match vehicle.disconnect() {
                Ok(()) => tracing::debug!("Vehicle disconnected"),
                Err(e) => tracing::warn!(error = %e, "Vehicle disconnect failed"),
            }
        }
        if self.detector.take().is_some() {
            tracing::debug!("Detector released");
        }
    }

    /// Whether anything is still held.
    pub fn is_empty(&self) -> bool {
        self.detector.is_none() && self.vehicle.is_none() && self.frames.is_none()
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.release();
    }
}
