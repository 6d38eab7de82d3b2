//! Monotonic time source
//!
//! All in-process deadlines are expressed as [`MonoTime`] offsets from a
//! clock's origin, never as wall-clock time, so that clock adjustments cannot
//! cause premature or late destruction.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Microseconds since the owning clock's origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MonoTime(pub u64);

impl MonoTime {
    pub const ZERO: MonoTime = MonoTime(0);

    pub fn from_duration(d: Duration) -> Self {
        MonoTime(d.as_micros().min(u64::MAX as u128) as u64)
    }

    pub fn from_millis(ms: u64) -> Self {
        MonoTime(ms.saturating_mul(1000))
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.0)
    }

    /// Time remaining until `self`, zero if already passed
    pub fn saturating_since(&self, earlier: MonoTime) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for MonoTime {
    type Output = MonoTime;

    fn add(self, rhs: Duration) -> MonoTime {
        MonoTime(self.0.saturating_add(MonoTime::from_duration(rhs).0))
    }
}

impl Sub<Duration> for MonoTime {
    type Output = MonoTime;

    fn sub(self, rhs: Duration) -> MonoTime {
        MonoTime(self.0.saturating_sub(MonoTime::from_duration(rhs).0))
    }
}

/// Source of monotonic time
pub trait Clock: Send + Sync {
    fn now(&self) -> MonoTime;
}

/// Real monotonic clock backed by [`Instant`]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MonoTime {
        MonoTime::from_duration(self.origin.elapsed())
    }
}

/// Manually advanced clock for simulated-time tests
#[derive(Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            micros: AtomicU64::new(0),
        }
    }

    pub fn starting_at(t: MonoTime) -> Self {
        ManualClock {
            micros: AtomicU64::new(t.0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.micros
            .fetch_add(MonoTime::from_duration(by).0, Ordering::SeqCst);
    }

    /// Move to `t`; never moves backwards
    pub fn set(&self, t: MonoTime) {
        self.micros.fetch_max(t.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> MonoTime {
        MonoTime(self.micros.load(Ordering::SeqCst))
    }
}
