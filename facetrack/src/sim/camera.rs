//! Simulated camera.

use std::thread;
use std::time::{Duration, Instant};

use super::world::SimWorld;
use crate::frame::{BlockingFrameReader, Frame, FrameError, LatestFrameReader};

/// Renders the [`SimWorld`] at a fixed frame rate.
///
/// Works as either transport: as a [`BlockingFrameReader`] it sleeps until
/// the next frame is due, as a [`LatestFrameReader`] it keeps returning the
/// last frame until a new one is due. Each rendered frame advances the world
/// by one frame period.
pub struct SimCamera {
    world: SimWorld,
    period: Duration,
    frame_limit: Option<u64>,
    frozen: bool,
    rendered: u64,
    next_due: Option<Instant>,
    last: Option<Frame>,
}

impl SimCamera {
    /// A camera running at `fps` frames per second.
    pub fn new(world: SimWorld, fps: u32) -> Self {
        Self {
            world,
            period: Duration::from_secs(1) / fps.max(1),
            frame_limit: None,
            frozen: false,
            rendered: 0,
            next_due: None,
            last: None,
        }
    }

    /// End the stream after `limit` frames.
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Never produce a frame.
    pub fn frozen(mut self) -> Self {
        self.frozen = true;
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Frames rendered so far.
    pub fn rendered(&self) -> u64 {
        self.rendered
    }

    fn limit_reached(&self) -> bool {
        self.frame_limit.is_some_and(|limit| self.rendered >= limit)
    }

    fn render(&mut self, now: Instant) -> Frame {
        self.world.advance(self.period);
        self.rendered += 1;
        self.next_due = Some(now + self.period);
        let frame = Frame::new(self.world.render());
        self.last = Some(frame.clone());
        frame
    }
}

impl BlockingFrameReader for SimCamera {
    fn read_frame(&mut self) -> Result<Frame, FrameError> {
        if self.frozen {
            thread::sleep(self.period);
            return Err(FrameError::Read("camera frozen".into()));
        }
        if self.limit_reached() {
            return Err(FrameError::EndOfStream);
        }
        if let Some(due) = self.next_due {
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }
        Ok(self.render(Instant::now()))
    }
}

impl LatestFrameReader for SimCamera {
    fn latest(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.frozen {
            return Ok(None);
        }
        let now = Instant::now();
        let due = self.next_due.map_or(true, |due| now >= due);
        if !due {
            return Ok(self.last.clone());
        }
        if self.limit_reached() {
            return Err(FrameError::EndOfStream);
        }
        Ok(Some(self.render(now)))
    }
}
