//! Wall-clock source for credential expiry
//!
//! Expiry is an absolute unix timestamp in milliseconds. `SystemClock` reads
//! it straight from the OS. `MonotonicClock` anchors one OS reading to a tokio
//! `Instant` and advances with tokio time, so expiry arithmetic and tokio
//! timers agree, including under a paused test runtime.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now" in unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// OS wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        unix_millis()
    }
}

/// Wall clock anchored once, then advanced by tokio's monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor_millis: u64,
    anchor: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::starting_at(unix_millis())
    }

    /// Anchor at an explicit unix-millisecond reading.
    pub fn starting_at(anchor_millis: u64) -> Self {
        Self {
            anchor_millis,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.anchor_millis + self.anchor.elapsed().as_millis() as u64
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
