//! Snapshot placement rules.
//!
//! A snapshot folds every event up to its valid time. A patch recorded later
//! with a valid time before the snapshot would be missing from it, so
//! snapshots may only sit in *patch-free* periods: time ranges that no
//! historical patch (`[valid_time, transaction_time]`) or future patch
//! (`[transaction_time, valid_time]`) covers.

use crate::{
    error::{Error, Result},
    time::{TIME_UNIT, TimeInterval, Timestamp},
};

/// Compute the sub-intervals of `interval` not covered by any of `patches`.
///
/// Patch intervals are closed. Each free sub-interval is shrunk by one
/// [`TIME_UNIT`] at both ends so a snapshot can never land exactly on a
/// patch boundary; sub-intervals that vanish under the shrink are dropped.
///
/// # Errors
///
/// Returns [`Error::InvalidTimeInterval`] unless `interval` is at least two
/// time units long.
pub fn patch_free_periods(
    interval: TimeInterval,
    patches: &[TimeInterval],
) -> Result<Vec<TimeInterval>> {
    if interval.start >= interval.end {
        return Err(Error::InvalidTimeInterval {
            start: interval.start,
            end: interval.end,
            reason: "start must be before end",
        });
    }
    if interval.end - interval.start < TIME_UNIT * 2 {
        return Err(Error::InvalidTimeInterval {
            start: interval.start,
            end: interval.end,
            reason: "interval must span at least two time units",
        });
    }

    let mut covering: Vec<TimeInterval> = patches
        .iter()
        .filter(|p| interval.overlaps_closed(p.start, p.end))
        .copied()
        .collect();
    covering.sort();

    let mut free = Vec::new();
    let mut cursor = interval.start;
    for patch in covering {
        if patch.start > cursor {
            free.push(TimeInterval::new(cursor, patch.start.min(interval.end)));
        }
        cursor = cursor.max(patch.end);
        if cursor >= interval.end {
            break;
        }
    }
    if cursor < interval.end {
        free.push(TimeInterval::new(cursor, interval.end));
    }

    Ok(free
        .into_iter()
        .filter_map(|period| {
            let trimmed = TimeInterval::new(period.start + TIME_UNIT, period.end - TIME_UNIT);
            (!trimmed.is_empty()).then_some(trimmed)
        })
        .collect())
}

/// The first patch interval containing `valid_time`, if any.
pub(crate) fn covering_patch(
    valid_time: Timestamp,
    patches: impl IntoIterator<Item = (Timestamp, Timestamp)>,
) -> Option<(Timestamp, Timestamp)> {
    patches
        .into_iter()
        .find(|(start, end)| *start <= valid_time && valid_time <= *end)
}
