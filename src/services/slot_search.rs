use chrono::{DateTime, Duration, Utc};

use crate::models::capture::TimeOfDay;
use crate::models::config::SchedulerConfig;
use crate::models::plan::Slot;
use crate::services::busy::{is_slot_free, BusyInterval};
use crate::services::time_utils;

#[derive(Debug, Clone, Copy)]
pub struct SlotSearchOptions {
    pub start_from: Option<DateTime<Utc>>,
    pub reference_now: DateTime<Utc>,
    pub enforce_working_window: bool,
    pub preferred_time_of_day: Option<TimeOfDay>,
    pub offset_minutes: i32,
}

impl SlotSearchOptions {
    pub fn new(reference_now: DateTime<Utc>, offset_minutes: i32) -> Self {
        Self {
            start_from: None,
            reference_now,
            enforce_working_window: true,
            preferred_time_of_day: None,
            offset_minutes,
        }
    }
}

/// Earliest free placement for `duration_minutes`. Preferred time-of-day
/// bands are tried day by day when present; otherwise the sweep walks each
/// working day (or runs continuously when the working window is off).
/// Earliest start always wins.
pub fn find_next_available_slot(
    busy: &[BusyInterval],
    duration_minutes: i64,
    options: &SlotSearchOptions,
    config: &SchedulerConfig,
) -> Option<Slot> {
    let base = search_base(options, config);

    if let Some(band) = options.preferred_time_of_day {
        return find_in_band(busy, duration_minutes, band, base, options, config);
    }

    if options.enforce_working_window {
        return sweep_working_days(busy, duration_minutes, base, None, options, config);
    }

    let horizon = base + Duration::days(config.search_days);
    sweep_range(busy, duration_minutes, base, horizon, config)
}

/// Same sweep, confined to [now, deadline - duration].
pub fn find_slot_before_deadline(
    busy: &[BusyInterval],
    duration_minutes: i64,
    deadline: DateTime<Utc>,
    options: &SlotSearchOptions,
    config: &SchedulerConfig,
) -> Option<Slot> {
    let base = search_base(options, config);
    if base + Duration::minutes(duration_minutes) > deadline {
        return None;
    }

    if options.enforce_working_window {
        sweep_working_days(busy, duration_minutes, base, Some(deadline), options, config)
    } else {
        sweep_range(busy, duration_minutes, base, deadline, config)
    }
}

/// Same sweep, confined to [max(window_start, now), window_end - duration].
pub fn find_slot_within_window(
    busy: &[BusyInterval],
    duration_minutes: i64,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    options: &SlotSearchOptions,
    config: &SchedulerConfig,
) -> Option<Slot> {
    let mut scoped = *options;
    scoped.start_from = Some(match scoped.start_from {
        Some(from) => from.max(window_start),
        None => window_start,
    });
    find_slot_before_deadline(busy, duration_minutes, window_end, &scoped, config)
}

/// Next available placement starting at or after the missed deadline.
pub fn find_late_placement_slot(
    busy: &[BusyInterval],
    duration_minutes: i64,
    deadline_end: DateTime<Utc>,
    options: &SlotSearchOptions,
    config: &SchedulerConfig,
) -> Option<Slot> {
    let mut scoped = *options;
    scoped.start_from = Some(match scoped.start_from {
        Some(from) => from.max(deadline_end),
        None => deadline_end,
    });
    find_next_available_slot(busy, duration_minutes, &scoped, config)
}

fn search_base(options: &SlotSearchOptions, config: &SchedulerConfig) -> DateTime<Utc> {
    let from = options
        .start_from
        .map(|from| from.max(options.reference_now))
        .unwrap_or(options.reference_now);
    time_utils::align_to_increment(from, config.slot_increment_minutes)
}

fn find_in_band(
    busy: &[BusyInterval],
    duration_minutes: i64,
    band: TimeOfDay,
    base: DateTime<Utc>,
    options: &SlotSearchOptions,
    config: &SchedulerConfig,
) -> Option<Slot> {
    let (band_start_minutes, band_end_minutes) = band.band_minutes();
    let reference = options.reference_now;

    for day_offset in 0..config.search_days {
        let local_date = time_utils::local_date(reference, options.offset_minutes)
            + Duration::days(day_offset);
        let midnight = time_utils::from_local_naive(
            local_date
                .and_hms_opt(0, 0, 0)
                .expect("midnight is a valid wall time"),
            options.offset_minutes,
        );
        let band_start = midnight + Duration::minutes(band_start_minutes);
        let band_end = midnight + Duration::minutes(band_end_minutes);

        if let Some(slot) =
            scan(busy, duration_minutes, base.max(band_start), band_end, config)
        {
            return Some(slot);
        }
    }

    None
}

fn sweep_working_days(
    busy: &[BusyInterval],
    duration_minutes: i64,
    base: DateTime<Utc>,
    hard_end: Option<DateTime<Utc>>,
    options: &SlotSearchOptions,
    config: &SchedulerConfig,
) -> Option<Slot> {
    for day_offset in 0..config.search_days {
        let day_start = time_utils::start_of_working_day(
            options.reference_now,
            options.offset_minutes,
            day_offset,
            config,
        );
        let mut day_end = time_utils::end_of_working_day(
            options.reference_now,
            options.offset_minutes,
            day_offset,
            config,
        );
        if let Some(hard_end) = hard_end {
            day_end = day_end.min(hard_end);
        }

        if let Some(slot) = scan(busy, duration_minutes, base.max(day_start), day_end, config) {
            return Some(slot);
        }
    }

    None
}

fn sweep_range(
    busy: &[BusyInterval],
    duration_minutes: i64,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    config: &SchedulerConfig,
) -> Option<Slot> {
    scan(busy, duration_minutes, from, until, config)
}

fn scan(
    busy: &[BusyInterval],
    duration_minutes: i64,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    config: &SchedulerConfig,
) -> Option<Slot> {
    let step = Duration::minutes(config.slot_increment_minutes.max(1));
    let duration = Duration::minutes(duration_minutes);
    let mut cursor = time_utils::align_to_increment(from, config.slot_increment_minutes);

    while cursor + duration <= until {
        let end = cursor + duration;
        if is_slot_free(cursor, end, busy) {
            return Some(Slot::new(cursor, end));
        }
        cursor += step;
    }

    None
}
