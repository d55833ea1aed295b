//! Marker-colour detector.

use super::world::MARKER;
use crate::detect::{Candidate, Detector, DetectorError};
use crate::frame::Frame;

/// Reports the bounding box of all [`MARKER`] pixels as a single face.
#[derive(Debug, Clone)]
pub struct SimDetector {
    confidence: f32,
}

impl Default for SimDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDetector {
    pub fn new() -> Self {
        Self { confidence: 0.9 }
    }

    /// Confidence attached to every detection.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }
}

impl Detector for SimDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Candidate>, DetectorError> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (x, y, pixel) in frame.image().enumerate_pixels() {
            if *pixel != MARKER {
                continue;
            }
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }

        Ok(bounds
            .map(|(x0, y0, x1, y1)| {
                Candidate::new(
                    x0 as f32,
                    y0 as f32,
                    (x1 + 1) as f32,
                    (y1 + 1) as f32,
                    self.confidence,
                )
            })
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimWorld, TargetPose};

    #[test]
    fn test_detects_rendered_marker() {
        let world = SimWorld::default();
        world.set_target(200.0, 100.0, 60.0);
        let frame = Frame::new(world.render());

        let candidates = SimDetector::new().detect(&frame).unwrap();
        assert_eq!(candidates.len(), 1);
        let c = candidates[0];
        assert_eq!((c.x1, c.y1, c.x2, c.y2), (170.0, 70.0, 230.0, 130.0));
        assert_eq!(c.confidence, 0.9);
    }

    #[test]
    fn test_hidden_marker_yields_nothing() {
        let world = SimWorld::default();
        world.hide_target();
        let frame = Frame::new(world.render());
        assert!(SimDetector::new().detect(&frame).unwrap().is_empty());
    }

    #[test]
    fn test_marker_clipped_at_frame_edge() {
        let world = SimWorld::default();
        world.set_target(0.0, 240.0, 40.0);
        let frame = Frame::new(world.render());
        let c = SimDetector::new().detect(&frame).unwrap()[0];
        assert_eq!(c.x1, 0.0);
        assert_eq!(c.x2, 20.0);
        assert_eq!(
            world.target(),
            TargetPose {
                x: 0.0,
                y: 240.0,
                size: 40.0
            }
        );
    }
}
