//! Millisecond wall clock driven by the tokio timer.
//!
//! Record timestamps (`created_ts`, `expires_ts`, `origin_server_ts`) are
//! epoch milliseconds. The clock anchors an epoch value to a tokio
//! [`Instant`] so that paused-time tests advance timestamps and timers
//! together.

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin_ms: u64,
    origin: Instant,
}

impl Clock {
    /// Clock anchored to the current system time.
    pub fn system() -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::starting_at(origin_ms)
    }

    /// Clock reading `origin_ms` right now.
    pub fn starting_at(origin_ms: u64) -> Self {
        Self {
            origin_ms,
            origin: Instant::now(),
        }
    }

    /// Current time in epoch milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.origin_ms + self.origin.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}
