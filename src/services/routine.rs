use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::error::ScheduleResult;
use crate::models::capture::{
    CaptureRecord, ConstraintKind, DurationFlexibility, RoutineKind, StartFlexibility, TimeOfDay,
};

const NIGHT_START_HOUR: u32 = 22;
const NIGHT_END_HOUR: u32 = 7;
const NIGHT_END_MINUTE: u32 = 30;
const MEAL_START_HOUR: u32 = 12;
const MEAL_END_HOUR: u32 = 14;

/// Rewrite a sleep/meal capture into an explicit local window. Returns
/// whether the capture was a routine (and therefore mutated). Re-invoking
/// with the same inputs yields identical fields.
pub fn normalize_routine_capture(
    capture: &mut CaptureRecord,
    tz: Tz,
    now: DateTime<Utc>,
) -> ScheduleResult<bool> {
    let Some(kind) = capture.routine_kind() else {
        return Ok(false);
    };

    match kind {
        RoutineKind::Sleep => normalize_sleep(capture, tz, now)?,
        RoutineKind::Meal => normalize_meal(capture, tz, now)?,
    }

    // A freeze that no manual touch backs is engine-made and goes away on
    // renormalization; user-locked captures keep theirs.
    if capture.manual_touch_at.is_none() {
        capture.freeze_until = None;
    }

    Ok(true)
}

fn normalize_sleep(capture: &mut CaptureRecord, tz: Tz, now: DateTime<Utc>) -> ScheduleResult<()> {
    let night_date = match base_instant(capture) {
        // An explicit target names the bedtime date.
        Some(base) => base.with_timezone(&tz).date_naive(),
        // Otherwise the day preference names the wake-up morning; tonight
        // starts one calendar day earlier.
        None => wake_date(capture, tz, now) - Duration::days(1),
    };

    let night_start =
        crate::services::time_utils::zoned_datetime_on(tz, night_date, NIGHT_START_HOUR, 0)?;
    let night_end = crate::services::time_utils::zoned_datetime_on(
        tz,
        night_date + Duration::days(1),
        NIGHT_END_HOUR,
        NIGHT_END_MINUTE,
    )?;

    apply_window(capture, night_start, night_end);
    capture.cannot_overlap = true;
    if capture.time_pref_time_of_day.is_none() {
        capture.time_pref_time_of_day = Some(TimeOfDay::Night);
    }
    Ok(())
}

fn normalize_meal(capture: &mut CaptureRecord, tz: Tz, now: DateTime<Utc>) -> ScheduleResult<()> {
    let window = match (capture.window_start, capture.window_end) {
        (Some(start), Some(end)) if end > start => (start, end),
        _ => {
            let date = meal_date(capture, tz, now);
            (
                crate::services::time_utils::zoned_datetime_on(tz, date, MEAL_START_HOUR, 0)?,
                crate::services::time_utils::zoned_datetime_on(tz, date, MEAL_END_HOUR, 0)?,
            )
        }
    };

    apply_window(capture, window.0, window.1);
    capture.cannot_overlap = false;
    if capture.time_pref_time_of_day.is_none() {
        capture.time_pref_time_of_day = Some(TimeOfDay::Afternoon);
    }
    Ok(())
}

fn apply_window(capture: &mut CaptureRecord, start: DateTime<Utc>, end: DateTime<Utc>) {
    capture.constraint_type = ConstraintKind::Window;
    capture.window_start = Some(start);
    capture.window_end = Some(end);
    capture.constraint_time = Some(start);
    capture.constraint_end = Some(end);
    capture.duration_flexibility = DurationFlexibility::Fixed;
    capture.start_flexibility = StartFlexibility::Soft;
    if capture.deadline_at.is_none() {
        capture.deadline_at = Some(end);
    }
}

fn base_instant(capture: &CaptureRecord) -> Option<DateTime<Utc>> {
    capture.start_target_at.or(capture.original_target_time)
}

fn wake_date(capture: &CaptureRecord, tz: Tz, now: DateTime<Utc>) -> NaiveDate {
    let today = now.with_timezone(&tz).date_naive();
    if capture.time_pref_day.as_deref() == Some("today") {
        today
    } else {
        today + Duration::days(1)
    }
}

fn meal_date(capture: &CaptureRecord, tz: Tz, now: DateTime<Utc>) -> NaiveDate {
    if let Some(base) = base_instant(capture) {
        return base.with_timezone(&tz).date_naive();
    }
    let local_now = now.with_timezone(&tz);
    let today = local_now.date_naive();
    match capture.time_pref_day.as_deref() {
        Some("today") => today,
        Some("tomorrow") => today + Duration::days(1),
        _ => {
            // No preference: today's lunch while it is still ahead.
            use chrono::Timelike;
            if local_now.hour() < MEAL_END_HOUR {
                today
            } else {
                today + Duration::days(1)
            }
        }
    }
}
