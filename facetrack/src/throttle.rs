//! Command-rate throttling.
//!
//! The vehicle link accepts velocity commands at a lower rate than frames
//! arrive. [`CommandThrottle`] forwards one command every `interval`
//! processed cycles while airborne and drops the rest.
//!
//! ```text
//! interval = 3, airborne
//! cycle:     1    2    3    4    5    6
//! offer:     -    -    ✓    -    -    ✓
//! ```
//!
//! A due command is forwarded even when it is all zeros, so a transition to
//! hover reaches the vehicle. Stop and emergency zero commands do not go
//! through the throttle at all.

/// Default number of processed cycles per forwarded command.
pub const DEFAULT_COMMAND_INTERVAL: u32 = 3;

/// Forwards every N-th command while airborne.
#[derive(Debug, Clone)]
pub struct CommandThrottle {
    interval: u32,
    counter: u32,
    forwarded: u64,
    dropped: u64,
}

impl CommandThrottle {
    /// Create a throttle. An interval of zero is treated as one.
    pub fn new(interval: u32) -> Self {
        Self {
            interval: interval.max(1),
            counter: 0,
            forwarded: 0,
            dropped: 0,
        }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Offer this cycle's command. Returns `true` when it should be sent.
    ///
    /// Nothing is counted while grounded, so the first window after takeoff
    /// is always a full `interval` cycles long.
    pub fn offer(&mut self, airborne: bool) -> bool {
        if !airborne {
            return false;
        }

        self.counter += 1;
        if self.counter >= self.interval {
            self.counter = 0;
            self.forwarded += 1;
            true
        } else {
            self.dropped += 1;
            false
        }
    }

    /// Restart the window. Called on takeoff and landing.
    pub fn reset(&mut self) {
        self.counter = 0;
    }

    /// Commands forwarded so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// Commands dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for CommandThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_INTERVAL)
    }
}
