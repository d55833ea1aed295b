//! Frame source backed by a dedicated acquisition thread.
//!
//! # Architecture
//!
//! ```text
//!  acquisition thread                      control loop thread
//!  ──────────────────                      ───────────────────
//!  reader.read_frame() ──► [ latest slot ] ◄── try_get_frame() (take, never waits)
//!        (blocking)          Mutex<Option>
//! ```
//!
//! The slot holds at most one frame. A newer frame overwrites an unread one,
//! so intermediate frames are dropped on purpose: only the newest matters to
//! the controller.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{Frame, FrameError, FrameSource};

/// Default bound on how long [`ThreadedFrameSource::stop`] waits for the
/// acquisition thread before detaching it.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a failed read before trying again.
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

/// A transport whose reads block until the next frame is decoded.
pub trait BlockingFrameReader: Send + 'static {
    /// Block until the next frame is available.
    ///
    /// [`FrameError::EndOfStream`] ends acquisition; any other error is
    /// treated as a hiccup and the read is retried.
    fn read_frame(&mut self) -> Result<Frame, FrameError>;

    /// Release the stream. Called on the acquisition thread when it exits.
    fn close(&mut self) {}
}

#[derive(Default)]
struct SlotState {
    latest: Option<Frame>,
    first_seen: bool,
    finished: bool,
    last_error: Option<FrameError>,
}

#[derive(Default)]
struct Shared {
    slot: Mutex<SlotState>,
    changed: Condvar,
    stop: AtomicBool,
    produced: AtomicU64,
    read_errors: AtomicU64,
}

/// Marks the slot finished when the acquisition thread exits, including by
/// panic, so `stop()` never waits on a dead thread.
struct FinishGuard(Arc<Shared>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.slot.lock().finished = true;
        self.0.changed.notify_all();
    }
}

/// [`FrameSource`] that isolates a blocking reader on its own thread.
pub struct ThreadedFrameSource {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl ThreadedFrameSource {
    /// Spawn the acquisition thread and wait for the first frame.
    ///
    /// Blocks the caller for at most `first_frame_timeout`. If no frame
    /// arrives in time, the thread is stopped and
    /// [`FrameError::FirstFrameTimeout`] is returned.
    pub fn start<R: BlockingFrameReader>(
        reader: R,
        first_frame_timeout: Duration,
    ) -> Result<Self, FrameError> {
        let mut source = Self::spawn(reader)?;
        match source.wait_first_frame(first_frame_timeout) {
            Ok(()) => Ok(source),
            Err(e) => {
                source.stop();
                Err(e)
            }
        }
    }

    /// Spawn the acquisition thread without waiting for a frame.
    ///
    /// Callers that need to stay responsive to cancellation while the stream
    /// warms up poll [`FrameSource::try_get_frame`] themselves.
    pub fn spawn<R: BlockingFrameReader>(reader: R) -> Result<Self, FrameError> {
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name("facetrack-frames".to_string())
            .spawn(move || acquisition_loop(reader, thread_shared))
            .map_err(|e| FrameError::Spawn(e.to_string()))?;

        Ok(Self {
            shared,
            handle: Some(handle),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        })
    }

    /// Block until the first frame has been read, the thread exits, or
    /// `timeout` elapses.
    pub fn wait_first_frame(&self, timeout: Duration) -> Result<(), FrameError> {
        let mut slot = self.shared.slot.lock();
        self.shared
            .changed
            .wait_while_for(&mut slot, |s| !s.first_seen && !s.finished, timeout);

        if slot.first_seen {
            tracing::debug!("Acquisition thread delivered first frame");
            Ok(())
        } else if slot.finished {
            Err(slot.last_error.clone().unwrap_or(FrameError::EndOfStream))
        } else {
            Err(FrameError::FirstFrameTimeout {
                timeout_ms: timeout.as_millis(),
            })
        }
    }

    /// Override how long `stop()` waits before detaching the thread.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Frames read by the acquisition thread so far (delivered or not).
    pub fn frames_produced(&self) -> u64 {
        self.shared.produced.load(Ordering::Relaxed)
    }

    /// Failed reads so far.
    pub fn read_errors(&self) -> u64 {
        self.shared.read_errors.load(Ordering::Relaxed)
    }

    /// Whether the acquisition thread has exited.
    pub fn is_finished(&self) -> bool {
        self.shared.slot.lock().finished
    }
}

fn acquisition_loop<R: BlockingFrameReader>(mut reader: R, shared: Arc<Shared>) {
    let _finish = FinishGuard(Arc::clone(&shared));

    while !shared.stop.load(Ordering::Acquire) {
        match reader.read_frame() {
            Ok(frame) => {
                {
                    let mut slot = shared.slot.lock();
                    slot.latest = Some(frame);
                    slot.first_seen = true;
                }
                shared.produced.fetch_add(1, Ordering::Relaxed);
                shared.changed.notify_all();
            }
            Err(FrameError::EndOfStream) => {
                tracing::info!("Video stream ended");
                shared.slot.lock().last_error = Some(FrameError::EndOfStream);
                break;
            }
            Err(e) => {
                let errors = shared.read_errors.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(error = %e, errors, "Frame read failed, retrying");
                shared.slot.lock().last_error = Some(e);
                thread::sleep(READ_RETRY_DELAY);
            }
        }
    }

    reader.close();
}

impl FrameSource for ThreadedFrameSource {
    fn try_get_frame(&mut self) -> Option<Frame> {
        self.shared.slot.lock().latest.take()
    }

    fn is_exhausted(&self) -> bool {
        let slot = self.shared.slot.lock();
        slot.finished && slot.latest.is_none()
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.shared.stop.store(true, Ordering::Release);

        let finished = {
            let mut slot = self.shared.slot.lock();
            self.shared
                .changed
                .wait_while_for(&mut slot, |s| !s.finished, self.join_timeout);
            slot.finished
        };

        if finished {
            if handle.join().is_err() {
                tracing::warn!("Acquisition thread panicked");
            }
            tracing::debug!(
                produced = self.frames_produced(),
                read_errors = self.read_errors(),
                "Acquisition thread stopped"
            );
        } else {
            tracing::warn!(
                timeout_ms = self.join_timeout.as_millis() as u64,
                "Acquisition thread did not stop in time, detaching"
            );
        }
    }
}

impl Drop for ThreadedFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}
