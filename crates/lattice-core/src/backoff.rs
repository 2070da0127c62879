//! Reconnect backoff math.
//!
//! The transport schedules reconnection after the current delay, then
//! doubles it, clamped to the cap. A successful open resets the schedule to
//! the initial delay.

use std::time::Duration;

/// Default initial reconnect delay in milliseconds.
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 50;
/// Default reconnect delay cap in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

/// Doubling reconnect schedule with a cap.
#[derive(Clone, Debug)]
pub struct BackoffSchedule {
    initial_ms: u64,
    max_ms: u64,
    next_ms: u64,
}

impl BackoffSchedule {
    /// Create a schedule starting at `initial_ms`, clamped to `max_ms`.
    #[must_use]
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial_ms,
            max_ms,
            next_ms: initial_ms.min(max_ms),
        }
    }

    /// The delay to wait before the next attempt. Doubles the stored delay
    /// for the attempt after, clamped to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next_ms;
        self.next_ms = current.saturating_mul(2).min(self.max_ms);
        Duration::from_millis(current)
    }

    /// Reset to the initial delay after a successful open.
    pub fn reset(&mut self) {
        self.next_ms = self.initial_ms.min(self.max_ms);
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_DELAY_MS)
    }
}
