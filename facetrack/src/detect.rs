//! Target detection boundary.
//!
//! The detection model is an external collaborator. It returns every face
//! candidate it found; the core keeps at most one per cycle, the largest by
//! bounding-box area among those above the confidence threshold (the closest
//! face is the one to follow).

use serde::Serialize;
use thiserror::Error;

use crate::frame::Frame;

/// Errors reported by a detector.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DetectorError {
    /// The model could not be loaded.
    #[error("failed to load model: {0}")]
    Load(String),

    /// Inference failed on a frame.
    #[error("inference failed: {0}")]
    Inference(String),
}

/// A raw detector box in corner form, frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl Candidate {
    /// Create a candidate from corner coordinates.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
        }
    }

    /// Bounding-box area in square pixels. Degenerate boxes have zero area.
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// The single target followed during one control cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TargetDetection {
    /// Horizontal centre in pixels.
    pub center_x: i32,
    /// Vertical centre in pixels (down is positive).
    pub center_y: i32,
    /// Box width in pixels.
    pub width: i32,
    /// Box height in pixels.
    pub height: i32,
    /// Detector confidence in `0.0..=1.0`.
    pub confidence: f32,
}

impl TargetDetection {
    /// Apparent size used by the distance axis: mean of width and height.
    pub fn size(&self) -> i32 {
        ((self.width as i64 + self.height as i64) / 2) as i32
    }

    /// Box area in square pixels.
    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }
}

impl From<Candidate> for TargetDetection {
    fn from(c: Candidate) -> Self {
        Self {
            center_x: ((c.x1 + c.x2) / 2.0) as i32,
            center_y: ((c.y1 + c.y2) / 2.0) as i32,
            width: (c.x2 - c.x1) as i32,
            height: (c.y2 - c.y1) as i32,
            confidence: c.confidence,
        }
    }
}

/// Face detector.
pub trait Detector: Send {
    /// Return every candidate found in `frame`, in any order.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Candidate>, DetectorError>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Candidate>, DetectorError> {
        (**self).detect(frame)
    }
}

/// Pick the largest candidate at or above `min_confidence`.
///
/// Ties keep the first candidate in detector order.
pub fn select_largest(candidates: &[Candidate], min_confidence: f32) -> Option<TargetDetection> {
    candidates
        .iter()
        .filter(|c| c.confidence >= min_confidence && c.area() > 0.0)
        .fold(None::<&Candidate>, |best, c| match best {
            Some(b) if b.area() >= c.area() => Some(b),
            _ => Some(c),
        })
        .map(|c| TargetDetection::from(*c))
}

/// Run the detector and reduce its output to at most one target.
pub fn detect_target<D: Detector + ?Sized>(
    detector: &mut D,
    frame: &Frame,
    min_confidence: f32,
) -> Result<Option<TargetDetection>, DetectorError> {
    let candidates = detector.detect(frame)?;
    Ok(select_largest(&candidates, min_confidence))
}
