//! Wall-clock abstraction used for all TTL math.
//!
//! The engine never calls `SystemTime::now()` directly; everything goes
//! through a shared [`Clock`] so that a drift-corrected source can be swapped
//! in (deployments syncing against NTP use [`OffsetClock`]) and so tests can
//! drive expiry deterministically with [`ManualClock`].

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Read-only time source. Safe to call concurrently from any component.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The local system clock, uncorrected.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock applying a fixed correction offset to an inner source, for hosts
/// whose local clock is known to be skewed against a reference time service.
pub struct OffsetClock<C> {
    inner: C,
    offset_ms: i64,
}

impl<C: Clock> OffsetClock<C> {
    pub fn new(inner: C, offset_ms: i64) -> Self {
        Self { inner, offset_ms }
    }
}

impl<C: Clock> Clock for OffsetClock<C> {
    fn now(&self) -> SystemTime {
        let now = self.inner.now();
        if self.offset_ms >= 0 {
            now + Duration::from_millis(self.offset_ms as u64)
        } else {
            now - Duration::from_millis(self.offset_ms.unsigned_abs())
        }
    }
}

/// A clock that only moves when told to. Test use.
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}
