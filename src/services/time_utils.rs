use chrono::offset::LocalResult;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::json;

use crate::error::{ScheduleError, ScheduleResult};
use crate::models::config::SchedulerConfig;

/// Offset convention used throughout the engine: minutes east of UTC, so
/// `local = utc + offset`.
pub fn to_local_naive(instant: DateTime<Utc>, offset_minutes: i32) -> NaiveDateTime {
    (instant + Duration::minutes(i64::from(offset_minutes))).naive_utc()
}

pub fn from_local_naive(local: NaiveDateTime, offset_minutes: i32) -> DateTime<Utc> {
    (local - Duration::minutes(i64::from(offset_minutes))).and_utc()
}

pub fn parse_datetime(value: &str) -> ScheduleResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| {
            ScheduleError::validation_with_details(
                "invalid datetime format",
                json!({"value": value, "error": err.to_string()}),
            )
        })
}

pub fn parse_optional_datetime(value: Option<&String>) -> ScheduleResult<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => Ok(Some(parse_datetime(raw)?)),
        Option::None => Ok(Option::None),
    }
}

pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub fn parse_timezone(name: &str) -> ScheduleResult<Tz> {
    name.parse::<Tz>().map_err(|_| {
        ScheduleError::validation_with_details(
            "unknown timezone",
            json!({"timezone": name}),
        )
    })
}

pub fn add_minutes(dt: DateTime<Utc>, minutes: i64) -> ScheduleResult<DateTime<Utc>> {
    dt.checked_add_signed(Duration::minutes(minutes))
        .ok_or_else(|| ScheduleError::validation("datetime arithmetic out of range"))
}

pub fn add_days(dt: DateTime<Utc>, days: i64) -> ScheduleResult<DateTime<Utc>> {
    dt.checked_add_signed(Duration::days(days))
        .ok_or_else(|| ScheduleError::validation("datetime arithmetic out of range"))
}

/// Wall time `(hour, minute)` in `tz` on the local date of `reference`
/// shifted by `day_offset` days, as an absolute instant.
///
/// The tz offset is resolved at the tentative instant, not at `reference`,
/// so the result stays correct across DST transitions. An ambiguous local
/// time (fall-back) maps to its earliest occurrence; a non-existent one
/// (spring-forward gap) slides forward an hour.
pub fn build_zoned_datetime(
    tz: Tz,
    reference: DateTime<Utc>,
    hour: u32,
    minute: u32,
    day_offset: i64,
) -> ScheduleResult<DateTime<Utc>> {
    let local_date = reference.with_timezone(&tz).date_naive() + Duration::days(day_offset);
    zoned_datetime_on(tz, local_date, hour, minute)
}

/// Wall time `(hour, minute)` in `tz` on the given local calendar date.
pub fn zoned_datetime_on(
    tz: Tz,
    date: NaiveDate,
    hour: u32,
    minute: u32,
) -> ScheduleResult<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, minute, 0).ok_or_else(|| {
        ScheduleError::validation_with_details(
            "invalid wall time",
            json!({"hour": hour, "minute": minute}),
        )
    })?;

    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            // Spring-forward gap: the wall time does not exist on this date.
            let shifted = naive + Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                    Ok(dt.with_timezone(&Utc))
                }
                LocalResult::None => Err(ScheduleError::validation_with_details(
                    "wall time unresolvable in timezone",
                    json!({"date": date.to_string(), "hour": hour, "minute": minute}),
                )),
            }
        }
    }
}

pub fn local_date(instant: DateTime<Utc>, offset_minutes: i32) -> NaiveDate {
    to_local_naive(instant, offset_minutes).date()
}

pub fn local_minutes_of_day(instant: DateTime<Utc>, offset_minutes: i32) -> i64 {
    let local = to_local_naive(instant, offset_minutes);
    i64::from(chrono::Timelike::hour(&local.time())) * 60
        + i64::from(chrono::Timelike::minute(&local.time()))
}

pub fn is_before_working_start(
    instant: DateTime<Utc>,
    offset_minutes: i32,
    config: &SchedulerConfig,
) -> bool {
    local_minutes_of_day(instant, offset_minutes) < i64::from(config.working_start_hour) * 60
}

pub fn is_after_working_end(
    instant: DateTime<Utc>,
    offset_minutes: i32,
    config: &SchedulerConfig,
) -> bool {
    local_minutes_of_day(instant, offset_minutes) > i64::from(config.working_end_hour) * 60
}

/// Local `working_start_hour` on the local date of `reference` plus
/// `day_offset` days.
pub fn start_of_working_day(
    reference: DateTime<Utc>,
    offset_minutes: i32,
    day_offset: i64,
    config: &SchedulerConfig,
) -> DateTime<Utc> {
    let date = local_date(reference, offset_minutes) + Duration::days(day_offset);
    let local = date
        .and_hms_opt(config.working_start_hour, 0, 0)
        .expect("working start is a valid wall time");
    from_local_naive(local, offset_minutes)
}

pub fn end_of_working_day(
    reference: DateTime<Utc>,
    offset_minutes: i32,
    day_offset: i64,
    config: &SchedulerConfig,
) -> DateTime<Utc> {
    let date = local_date(reference, offset_minutes) + Duration::days(day_offset);
    let local = date
        .and_hms_opt(config.working_end_hour, 0, 0)
        .expect("working end is a valid wall time");
    from_local_naive(local, offset_minutes)
}

/// Round up to the next slot boundary (15-minute grid by default).
pub fn align_to_increment(instant: DateTime<Utc>, increment_minutes: i64) -> DateTime<Utc> {
    let step = increment_minutes.max(1) * 60;
    let ts = instant.timestamp();
    let aligned = ts.div_euclid(step) * step + if ts.rem_euclid(step) == 0 { 0 } else { step };
    Utc.timestamp_opt(aligned, 0)
        .single()
        .unwrap_or(instant)
}

/// UTC calendar-date bucket key, `YYYY-MM-DD`.
pub fn day_key(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%d").to_string()
}
