//! Reconnect backoff.

use std::time::Duration;

/// Ceiling for any reconnect delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// `min(base * 2^attempt, MAX_BACKOFF)`, saturating instead of overflowing.
pub fn backoff(attempt: u32, base: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

/// Attempt counter for the reconnect loop.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration) -> Self {
        Self { base, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = backoff(self.attempt, self.base);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Called after a successful authentication.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
