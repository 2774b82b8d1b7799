//! Reconnect delay schedule
//!
//! Delays double from one second and saturate at a cap:
//! 1s, 2s, 4s, 8s, 16s, 30s, 30s, ... for the default 30s cap.
//! There is no jitter, so the schedule is exact and reproducible.

use std::time::Duration;

use backoff::backoff::Backoff;

/// Default ceiling for the reconnect delay
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Attempt counter plus capped doubling delay
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    attempt: u32,
    max_delay: Duration,
}

impl ReconnectBackoff {
    pub fn new(max_delay: Duration) -> Self {
        Self { attempt: 0, max_delay }
    }

    /// Number of reconnects scheduled since the last successful open
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for a given attempt: `min(2^attempt, max)` seconds
    pub fn delay_for(attempt: u32, max_delay: Duration) -> Duration {
        2u64.checked_pow(attempt)
            .map(Duration::from_secs)
            .map_or(max_delay, |delay| delay.min(max_delay))
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECONNECT_DELAY)
    }
}

impl Backoff for ReconnectBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = Self::delay_for(self.attempt, self.max_delay);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}
