//! Wall-clock source for drift and start-time calculations.
//!
//! The capture source never reads the system time directly; it asks a
//! [`WallClock`].  Production code uses [`SystemClock`], tests drive a
//! manual clock by hand.

#[cfg(test)]
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Monotonic wall time in microseconds.
pub trait WallClock: Send + Sync {
    fn now_us(&self) -> i64;
}

/// Microseconds elapsed since the clock was created.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock for SystemClock {
    fn now_us(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }
}

/// A clock that only moves when told to.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ManualClock {
    now: AtomicI64,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start_us: i64) -> Self {
        Self {
            now: AtomicI64::new(start_us),
        }
    }

    pub fn set(&self, us: i64) {
        self.now.store(us, Ordering::SeqCst);
    }

    pub fn advance(&self, us: i64) {
        self.now.fetch_add(us, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl WallClock for ManualClock {
    fn now_us(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
