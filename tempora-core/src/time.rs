//! Time axes and the clock port.
//!
//! Every persisted fact carries two timestamps: the *valid time* (when the
//! fact holds in the domain) and the *transaction time* (when it was
//! recorded). All timestamps are UTC and compared at microsecond
//! granularity, the smallest step the engine ever adds or subtracts.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// A point on either time axis.
pub type Timestamp = DateTime<Utc>;

/// Lower bound used for "since the beginning" rebuilds and open-ended
/// searches.
pub const BEGINNING_OF_TIME: Timestamp = DateTime::<Utc>::MIN_UTC;

/// Upper bound for open-ended searches.
pub const END_OF_TIME: Timestamp = DateTime::<Utc>::MAX_UTC;

/// Smallest representable step between two timestamps.
pub const TIME_UNIT: TimeDelta = TimeDelta::microseconds(1);

/// Source of the current time.
///
/// All instances sharing a backend must agree on time closely enough that
/// transaction times written by different processes still order the events
/// they describe.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time from the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeInterval {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeInterval {
    #[must_use]
    pub const fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// The whole representable time line.
    #[must_use]
    pub const fn everything() -> Self {
        Self::new(BEGINNING_OF_TIME, END_OF_TIME)
    }

    #[must_use]
    pub fn contains(&self, at: Timestamp) -> bool {
        self.start <= at && at < self.end
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Whether the closed range `[start, end]` shares at least one point with
    /// this interval.
    #[must_use]
    pub fn overlaps_closed(&self, start: Timestamp, end: Timestamp) -> bool {
        start < self.end && end >= self.start
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(hour: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn interval_is_half_open() {
        let interval = TimeInterval::new(at(1), at(2));
        assert!(interval.contains(at(1)));
        assert!(!interval.contains(at(2)));
    }

    #[test]
    fn closed_overlap_touches_start_but_not_end() {
        let interval = TimeInterval::new(at(2), at(4));
        assert!(interval.overlaps_closed(at(0), at(2)));
        assert!(!interval.overlaps_closed(at(4), at(5)));
        assert!(!interval.overlaps_closed(at(0), at(1)));
    }
}
