//! Clocks that make publish times predictable.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, TimeZone, Utc};
use eventstash::{Clock, Timestamp};

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub Timestamp);

impl FixedClock {
    /// A clock stuck at `datetime`.
    pub fn at(datetime: DateTime<Utc>) -> Self {
        Self(Timestamp::new(datetime))
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self(epoch())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        self.0
    }
}

/// Advances by a fixed step on every reading, starting at `start`.
#[derive(Debug)]
pub struct SteppingClock {
    start: Timestamp,
    step: Duration,
    ticks: AtomicI64,
}

impl SteppingClock {
    /// Starts at `start` and moves `step` further on each reading.
    pub const fn new(start: Timestamp, step: Duration) -> Self {
        Self {
            start,
            step,
            ticks: AtomicI64::new(0),
        }
    }

    /// One second per reading from [`epoch`].
    pub fn per_second() -> Self {
        Self::new(epoch(), Duration::seconds(1))
    }

    /// How many times the clock has been read.
    pub fn readings(&self) -> i64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> Timestamp {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        let offset = self.step * i32::try_from(tick).unwrap_or(i32::MAX);
        Timestamp::new(*self.start.as_datetime() + offset)
    }
}

/// 2024-01-01T00:00:00Z, the base instant of every fixture.
pub fn epoch() -> Timestamp {
    Timestamp::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default())
}

/// `seconds` after [`epoch`].
pub fn at(seconds: i64) -> Timestamp {
    Timestamp::new(*epoch().as_datetime() + Duration::seconds(seconds))
}
