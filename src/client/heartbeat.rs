//! Application-level heartbeat accounting for the daemon connection.

use std::time::Duration;

use tokio::time::Instant;

/// Consecutive missed pongs after which the connection is considered dead.
pub const MAX_MISSED_PONGS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Healthy,
    /// Pong overdue; carries the current missed count
    Missed(u32),
    Dead,
}

/// Tracks the last pong and counts ticks on which it was overdue.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    last_pong: Instant,
    missed: u32,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_pong: now,
            missed: 0,
        }
    }

    pub fn record_pong(&mut self, now: Instant) {
        self.last_pong = now;
        self.missed = 0;
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Evaluate on a heartbeat tick, before sending the next ping.
    pub fn on_tick(&mut self, now: Instant) -> HeartbeatStatus {
        if now.saturating_duration_since(self.last_pong) > self.interval * 2 {
            self.missed += 1;
            if self.missed >= MAX_MISSED_PONGS {
                HeartbeatStatus::Dead
            } else {
                HeartbeatStatus::Missed(self.missed)
            }
        } else {
            self.missed = 0;
            HeartbeatStatus::Healthy
        }
    }
}
