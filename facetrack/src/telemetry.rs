//! Per-cycle telemetry for displays and logs.
//!
//! # Architecture
//!
//! ```text
//! session loop ──► TelemetrySink::publish(snapshot) ──► observer
//!                  (must never block)                   (CLI, GUI, test)
//! ```
//!
//! The loop publishes one [`TelemetrySnapshot`] per processed frame. Sinks
//! decide what to keep: [`ChannelSink`] hands snapshots to another thread and
//! drops them when the consumer falls behind, [`RateLimitedSink`] thins the
//! stream to a display rate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::control::VelocityCommand;
use crate::detect::TargetDetection;
use crate::frame::Frame;
use crate::supervisor::FlightState;

/// Default capacity of a [`ChannelSink`].
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Point-in-time view of one control cycle.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    /// Processed-frame counter since tracking began.
    pub cycle: u64,

    /// The frame this cycle processed.
    #[serde(skip)]
    pub frame: Option<Frame>,

    /// The selected target, if any.
    pub detection: Option<TargetDetection>,

    /// Command computed this cycle, after interlocks.
    pub command: VelocityCommand,

    /// Whether the command was sent to the vehicle.
    pub forwarded: bool,

    /// Processed frames per second since tracking began.
    pub fps: f64,

    /// Most recent battery reading.
    pub battery_percent: Option<u8>,

    pub flight_state: FlightState,
    pub airborne: bool,
    pub frames_without_detection: u32,
}

/// Receives telemetry from the session loop.
///
/// `publish` is called on the session thread and must return promptly.
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, snapshot: TelemetrySnapshot);
}

impl<S: TelemetrySink + ?Sized> TelemetrySink for Arc<S> {
    fn publish(&self, snapshot: TelemetrySnapshot) {
        (**self).publish(snapshot)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn publish(&self, _snapshot: TelemetrySnapshot) {}
}

/// Forwards snapshots over a bounded channel, dropping on overflow.
#[derive(Debug)]
pub struct ChannelSink {
    sender: mpsc::Sender<TelemetrySnapshot>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiver the observer reads from.
    ///
    /// The receiver may be drained from a plain thread with
    /// `blocking_recv`/`try_recv`; no runtime is needed.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetrySnapshot>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                dropped: AtomicU64::new(0),
            },
            receiver,
        )
    }

    /// Snapshots dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for ChannelSink {
    fn publish(&self, snapshot: TelemetrySnapshot) {
        match self.sender.try_send(snapshot) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            // Observer has gone away; nothing to do
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

struct RateState {
    last_forwarded: Option<Instant>,
    last_state: Option<FlightState>,
}

/// Forwards at most one snapshot per interval to an inner sink.
///
/// A snapshot whose flight state differs from the last forwarded one always
/// passes, so observers never miss a lifecycle change.
pub struct RateLimitedSink<S: TelemetrySink> {
    inner: S,
    interval: Duration,
    state: Mutex<RateState>,
    suppressed: AtomicU64,
}

impl<S: TelemetrySink> RateLimitedSink<S> {
    pub fn new(inner: S, interval: Duration) -> Self {
        Self {
            inner,
            interval,
            state: Mutex::new(RateState {
                last_forwarded: None,
                last_state: None,
            }),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Limit to `hz` snapshots per second.
    pub fn per_second(inner: S, hz: u32) -> Self {
        Self::new(inner, Duration::from_secs(1) / hz.max(1))
    }

    /// Snapshots swallowed by the limiter.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: TelemetrySink> TelemetrySink for RateLimitedSink<S> {
    fn publish(&self, snapshot: TelemetrySnapshot) {
        let now = Instant::now();
        let forward = {
            let mut state = self.state.lock();
            let due = state
                .last_forwarded
                .map_or(true, |last| now.duration_since(last) >= self.interval);
            let changed = state.last_state != Some(snapshot.flight_state);
            if due || changed {
                state.last_forwarded = Some(now);
                state.last_state = Some(snapshot.flight_state);
                true
            } else {
                false
            }
        };

        if forward {
            self.inner.publish(snapshot);
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Keeps the most recent snapshots in memory.
pub struct MemorySink {
    capacity: usize,
    snapshots: Mutex<VecDeque<TelemetrySnapshot>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            snapshots: Mutex::new(VecDeque::new()),
        }
    }

    /// Copy of the retained snapshots, oldest first.
    pub fn snapshots(&self) -> Vec<TelemetrySnapshot> {
        self.snapshots.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<TelemetrySnapshot> {
        self.snapshots.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }
}

impl TelemetrySink for MemorySink {
    fn publish(&self, snapshot: TelemetrySnapshot) {
        let mut snapshots = self.snapshots.lock();
        if snapshots.len() == self.capacity {
            snapshots.pop_front();
        }
        snapshots.push_back(snapshot);
    }
}

/// Processed frames per second since tracking began.
#[derive(Debug, Clone, Default)]
pub struct FpsCounter {
    started: Option<Instant>,
    frames: u64,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) counting at `now`.
    pub fn start(&mut self, now: Instant) {
        self.started = Some(now);
        self.frames = 0;
    }

    /// Count one processed frame and return the updated rate.
    pub fn record(&mut self, now: Instant) -> f64 {
        if self.started.is_none() {
            self.started = Some(now);
        }
        self.frames += 1;
        self.fps(now)
    }

    /// Average rate from start to `now`. Zero until time has elapsed.
    pub fn fps(&self, now: Instant) -> f64 {
        let Some(started) = self.started else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(started).as_secs_f64();
        if elapsed > 0.0 {
            self.frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cycle: u64, flight_state: FlightState) -> TelemetrySnapshot {
        TelemetrySnapshot {
            cycle,
            frame: None,
            detection: None,
            command: VelocityCommand::HOLD,
            forwarded: false,
            fps: 0.0,
            battery_percent: Some(80),
            flight_state,
            airborne: false,
            frames_without_detection: 0,
        }
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(2);
        for cycle in 0..5 {
            sink.publish(snapshot(cycle, FlightState::Tracking));
        }

        assert_eq!(sink.dropped(), 3);
        assert_eq!(rx.try_recv().unwrap().cycle, 0);
        assert_eq!(rx.try_recv().unwrap().cycle, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_tolerates_closed_receiver() {
        let (sink, rx) = ChannelSink::new(2);
        drop(rx);
        sink.publish(snapshot(0, FlightState::Tracking));
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_rate_limited_sink_thins_stream() {
        let sink = RateLimitedSink::new(MemorySink::new(100), Duration::from_secs(60));
        for cycle in 0..10 {
            sink.publish(snapshot(cycle, FlightState::Tracking));
        }

        assert_eq!(sink.inner().len(), 1);
        assert_eq!(sink.suppressed(), 9);
    }

    #[test]
    fn test_rate_limited_sink_passes_state_changes() {
        let sink = RateLimitedSink::new(MemorySink::new(100), Duration::from_secs(60));
        sink.publish(snapshot(0, FlightState::Tracking));
        sink.publish(snapshot(1, FlightState::Tracking));
        sink.publish(snapshot(2, FlightState::Landing));

        let cycles: Vec<u64> = sink.inner().snapshots().iter().map(|s| s.cycle).collect();
        assert_eq!(cycles, vec![0, 2]);
    }

    #[test]
    fn test_memory_sink_keeps_latest() {
        let sink = MemorySink::new(3);
        for cycle in 0..5 {
            sink.publish(snapshot(cycle, FlightState::Tracking));
        }
        let cycles: Vec<u64> = sink.snapshots().iter().map(|s| s.cycle).collect();
        assert_eq!(cycles, vec![2, 3, 4]);
        assert_eq!(sink.latest().unwrap().cycle, 4);
    }

    #[test]
    fn test_fps_counter() {
        let start = Instant::now();
        let mut fps = FpsCounter::new();
        assert_eq!(fps.fps(start), 0.0);

        fps.start(start);
        for _ in 0..30 {
            fps.record(start);
        }
        // No time elapsed yet
        assert_eq!(fps.fps(start), 0.0);
        let rate = fps.fps(start + Duration::from_secs(2));
        assert!((rate - 15.0).abs() < 1e-9);
        assert_eq!(fps.frames(), 30);
    }

    #[test]
    fn test_snapshot_serializes_without_frame() {
        let mut s = snapshot(7, FlightState::Tracking);
        s.frame = Some(Frame::new(image::RgbImage::new(2, 2)));
        s.detection = Some(TargetDetection {
            center_x: 10,
            center_y: 20,
            width: 30,
            height: 40,
            confidence: 0.5,
        });

        let value = serde_json::to_value(&s).unwrap();
        assert_eq!(value["cycle"], 7);
        assert_eq!(value["flight_state"], "tracking");
        assert_eq!(value["detection"]["width"], 30);
        assert!(value.get("frame").is_none());
    }
}
