//! Camera frames and frame sources.
//!
//! A [`FrameSource`] hands out the most recent camera frame without ever
//! blocking the control loop. Two implementations cover the two kinds of
//! transport a vehicle link can expose:
//!
//! - [`PolledFrameSource`]: the transport exposes a "latest frame" pointer
//!   that may keep returning the same buffer. Duplicates are filtered by
//!   content digest.
//! - [`ThreadedFrameSource`]: the transport only offers a blocking read.
//!   A dedicated thread reads into a single-slot cell and the consumer takes
//!   whatever is newest.
//!
//! The implementation is chosen once, when the session is constructed; the
//! loop only ever sees `Box<dyn FrameSource>`.

mod polled;
mod threaded;

use std::fmt;
use std::sync::{Arc, OnceLock};

use image::RgbImage;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use polled::{LatestFrameReader, PolledFrameSource};
pub use threaded::{BlockingFrameReader, ThreadedFrameSource, DEFAULT_JOIN_TIMEOUT};

/// Errors produced while acquiring frames.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The underlying stream could not be opened.
    #[error("failed to open video stream: {0}")]
    Open(String),

    /// A read from the stream failed.
    #[error("frame read failed: {0}")]
    Read(String),

    /// The stream has ended.
    #[error("video stream ended")]
    EndOfStream,

    /// No frame arrived before the startup deadline.
    #[error("no frame within {timeout_ms} ms of startup")]
    FirstFrameTimeout { timeout_ms: u128 },

    /// The acquisition thread could not be spawned.
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(String),
}

/// SHA-256 digest of a frame's pixel content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameDigest([u8; 32]);

impl FrameDigest {
    fn of(width: u32, height: u32, pixels: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(width.to_le_bytes());
        hasher.update(height.to_le_bytes());
        hasher.update(pixels);
        Self(hasher.finalize().into())
    }
}

impl fmt::Debug for FrameDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// An immutable RGB camera frame.
///
/// Cloning is cheap: the pixel buffer is shared. The content digest is only
/// computed when first asked for, and clones share it.
#[derive(Clone)]
pub struct Frame {
    data: Arc<FrameData>,
}

struct FrameData {
    image: RgbImage,
    digest: OnceLock<FrameDigest>,
}

impl Frame {
    /// Wrap a decoded image.
    pub fn new(image: RgbImage) -> Self {
        Self {
            data: Arc::new(FrameData {
                image,
                digest: OnceLock::new(),
            }),
        }
    }

    /// Build a frame from a raw packed RGB buffer.
    ///
    /// Returns `None` if the buffer length does not match `width * height * 3`.
    pub fn from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        RgbImage::from_raw(width, height, pixels).map(Self::new)
    }

    /// Frame width in pixels.
    pub fn width(&self) -> u32 {
        self.data.image.width()
    }

    /// Frame height in pixels.
    pub fn height(&self) -> u32 {
        self.data.image.height()
    }

    /// Borrow the pixels.
    pub fn image(&self) -> &RgbImage {
        &self.data.image
    }

    /// Content digest used for duplicate detection.
    pub fn digest(&self) -> FrameDigest {
        let image = &self.data.image;
        *self
            .data
            .digest
            .get_or_init(|| FrameDigest::of(image.width(), image.height(), image.as_raw()))
    }

    /// Whether two frames carry identical content.
    pub fn same_content(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.data, &other.data) || self.digest() == other.digest()
    }

    #[cfg(test)]
    pub(crate) fn digest_computed(&self) -> bool {
        self.data.digest.get().is_some()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("digest", &self.data.digest.get())
            .finish()
    }
}

/// Non-blocking supplier of the newest camera frame.
pub trait FrameSource: Send {
    /// Return the newest frame if one arrived since the last call.
    ///
    /// Never blocks. `None` means "no new frame yet" and is not an error.
    fn try_get_frame(&mut self) -> Option<Frame>;

    /// Whether the stream has ended and no further frames will arrive.
    fn is_exhausted(&self) -> bool {
        false
    }

    /// Release the underlying stream. Idempotent.
    fn stop(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn try_get_frame(&mut self) -> Option<Frame> {
        (**self).try_get_frame()
    }

    fn is_exhausted(&self) -> bool {
        (**self).is_exhausted()
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}
