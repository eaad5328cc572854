use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::calendar::CalendarEvent;
use crate::models::plan::Slot;

/// Buffered half-open interval derived from a calendar event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BusyInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Expand each event by a symmetric buffer and return the intervals sorted
/// by start. Events already in progress (start ≤ now < end) get no buffer
/// so the engine can still pack work right after them.
pub fn compute_busy_intervals(
    events: &[CalendarEvent],
    buffer_minutes: i64,
    now: DateTime<Utc>,
    offset_minutes: i32,
) -> Vec<BusyInterval> {
    let buffer = Duration::minutes(buffer_minutes.max(0));
    let mut intervals: Vec<BusyInterval> = events
        .iter()
        .filter_map(|event| {
            let start = event.start_instant(offset_minutes);
            let end = event.end_instant(offset_minutes);
            if end <= start {
                return None;
            }
            let in_progress = start <= now && now < end;
            if in_progress {
                Some(BusyInterval { start, end })
            } else {
                Some(BusyInterval {
                    start: start - buffer,
                    end: end + buffer,
                })
            }
        })
        .collect();

    intervals.sort_by_key(|interval| (interval.start, interval.end));
    intervals
}

/// True iff [start, end) touches no busy interval.
pub fn is_slot_free(start: DateTime<Utc>, end: DateTime<Utc>, intervals: &[BusyInterval]) -> bool {
    if end <= start {
        return false;
    }
    intervals
        .iter()
        .all(|interval| end <= interval.start || interval.end <= start)
}

/// Record a newly committed slot so later searches in the same request see
/// it as taken.
pub fn register_interval(intervals: &mut Vec<BusyInterval>, slot: &Slot, buffer_minutes: i64) {
    let buffer = Duration::minutes(buffer_minutes.max(0));
    intervals.push(BusyInterval {
        start: slot.start - buffer,
        end: slot.end + buffer,
    });
    intervals.sort_by_key(|interval| (interval.start, interval.end));
}
