//! Frame source over a pull-style "latest frame" pointer.

use super::{Frame, FrameDigest, FrameError, FrameSource};

/// A transport that exposes its most recently decoded frame.
///
/// Calling [`latest`](Self::latest) repeatedly may return the same buffer
/// until the decoder produces a new one.
pub trait LatestFrameReader: Send {
    /// Return the most recently decoded frame, if any has been decoded yet.
    fn latest(&mut self) -> Result<Option<Frame>, FrameError>;

    /// Release the stream.
    fn close(&mut self) {}
}

/// Deduplicating [`FrameSource`] over a [`LatestFrameReader`].
///
/// A frame is delivered only if its content digest differs from the last
/// delivered one, so a transport that keeps repeating its last buffer never
/// looks like a live stream.
pub struct PolledFrameSource<R: LatestFrameReader> {
    reader: Option<R>,
    last_digest: Option<FrameDigest>,
    duplicates: u64,
    read_errors: u64,
}

impl<R: LatestFrameReader> PolledFrameSource<R> {
    /// Wrap a reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
            last_digest: None,
            duplicates: 0,
            read_errors: 0,
        }
    }

    /// Number of polls that returned an already-delivered frame.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Number of failed reads.
    pub fn read_errors(&self) -> u64 {
        self.read_errors
    }
}

impl<R: LatestFrameReader> FrameSource for PolledFrameSource<R> {
    fn try_get_frame(&mut self) -> Option<Frame> {
        let reader = self.reader.as_mut()?;

        let frame = match reader.latest() {
            Ok(Some(frame)) => frame,
            Ok(None) => return None,
            Err(FrameError::EndOfStream) => {
                tracing::info!("Video stream ended");
                self.stop();
                return None;
            }
            Err(e) => {
                self.read_errors += 1;
                tracing::debug!(error = %e, errors = self.read_errors, "Frame poll failed");
                return None;
            }
        };

        let digest = frame.digest();
        if self.last_digest == Some(digest) {
            self.duplicates += 1;
            return None;
        }

        self.last_digest = Some(digest);
        Some(frame)
    }

    fn is_exhausted(&self) -> bool {
        self.reader.is_none()
    }

    fn stop(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.close();
            tracing::debug!(
                duplicates = self.duplicates,
                read_errors = self.read_errors,
                "Polled frame source stopped"
            );
        }
    }
}

impl<R: LatestFrameReader> Drop for PolledFrameSource<R> {
    fn drop(&mut self) {
        self.stop();
    }
}
