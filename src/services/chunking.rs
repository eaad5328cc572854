use chrono::{DateTime, Utc};

use crate::models::config::SchedulerConfig;
use crate::models::plan::Slot;
use crate::services::busy::{register_interval, BusyInterval};
use crate::services::slot_search::{find_next_available_slot, SlotSearchOptions};

/// Round a duration up to the slot grid.
pub fn round_up_to_increment(minutes: i64, increment: i64) -> i64 {
    let increment = increment.max(1);
    ((minutes.max(1) + increment - 1) / increment) * increment
}

/// Split a total duration into chunk lengths. The sum always equals the
/// grid-rounded total; every chunk stays at or above `min_chunk`, which may
/// force fewer chunks than `max_splits` permits.
pub fn generate_chunk_durations(
    total_minutes: i64,
    min_chunk: i64,
    max_splits: Option<i64>,
    allow_split: bool,
    config: &SchedulerConfig,
) -> Vec<i64> {
    let increment = config.slot_increment_minutes.max(1);
    let rounded = round_up_to_increment(total_minutes, increment);
    if !allow_split {
        return vec![rounded];
    }

    let min_chunk = min_chunk.max(increment);
    let target = config.target_chunk_minutes.max(increment);
    let increments = rounded / increment;

    let by_min_chunk = (rounded / min_chunk).max(1);
    let by_splits = max_splits.filter(|splits| *splits > 0).unwrap_or(i64::MAX);
    let by_target = (rounded + target - 1) / target;

    let mut count = by_min_chunk.min(by_splits).min(by_target).max(1);
    while count > 1 && (increments / count) * increment < min_chunk {
        count -= 1;
    }

    let base = increments / count;
    let remainder = increments % count;
    (0..count)
        .map(|index| {
            let extra = if index < remainder { 1 } else { 0 };
            (base + extra) * increment
        })
        .collect()
}

/// Greedily place each chunk in the earliest free sub-slot after the
/// previous chunk's end. All-or-nothing: if any chunk misses the range end,
/// the whole placement is rejected. On success the returned busy set has
/// every placement registered.
pub fn place_chunks_within_range(
    durations: &[i64],
    busy: &[BusyInterval],
    range: Slot,
    reference_now: DateTime<Utc>,
    enforce_working_window: bool,
    offset_minutes: i32,
    config: &SchedulerConfig,
) -> Option<(Vec<Slot>, Vec<BusyInterval>)> {
    let mut working = busy.to_vec();
    let mut placements = Vec::with_capacity(durations.len());
    let mut cursor = range.start;

    for duration in durations {
        let options = SlotSearchOptions {
            start_from: Some(cursor),
            reference_now,
            enforce_working_window,
            preferred_time_of_day: None,
            offset_minutes,
        };
        let slot = find_next_available_slot(&working, *duration, &options, config)?;
        if slot.end > range.end {
            return None;
        }
        register_interval(&mut working, &slot, config.buffer_minutes);
        cursor = slot.end;
        placements.push(slot);
    }

    Some((placements, working))
}
