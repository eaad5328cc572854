use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::ScheduleResult;
use crate::models::capture::{CaptureRecord, ConstraintKind};
use crate::models::config::SchedulerConfig;
use crate::models::plan::{SchedulingPlan, Slot};
use crate::services::time_utils;

/// Deadline precedence: explicit `deadline_at`, then the constraint's own
/// rule, then the window end.
pub fn resolve_deadline(
    capture: &CaptureRecord,
    tz: Tz,
    config: &SchedulerConfig,
) -> ScheduleResult<Option<DateTime<Utc>>> {
    if let Some(deadline) = capture.deadline_at {
        return Ok(Some(deadline));
    }

    let constraint_deadline = match capture.constraint_type {
        ConstraintKind::DeadlineTime => capture.constraint_time,
        ConstraintKind::DeadlineDate => match capture.constraint_date {
            Some(date) => Some(time_utils::zoned_datetime_on(
                tz,
                date,
                config.working_end_hour,
                0,
            )?),
            None => None,
        },
        _ => None,
    };
    if constraint_deadline.is_some() {
        return Ok(constraint_deadline);
    }

    Ok(capture.window_end)
}

/// Derive the search mode for a capture. The constraint kind has already
/// been alias-normalized at the model boundary.
pub fn compute_scheduling_plan(
    capture: &CaptureRecord,
    now: DateTime<Utc>,
    tz: Tz,
    config: &SchedulerConfig,
) -> ScheduleResult<SchedulingPlan> {
    match capture.constraint_type {
        ConstraintKind::DeadlineTime | ConstraintKind::DeadlineDate => {
            match resolve_deadline(capture, tz, config)? {
                Some(deadline) => Ok(SchedulingPlan::Deadline { deadline }),
                None => Ok(SchedulingPlan::Flexible),
            }
        }
        ConstraintKind::StartTime => {
            let target = capture
                .constraint_time
                .or(capture.original_target_time)
                .or(capture.start_target_at);
            match target {
                Some(target) => {
                    let start = target.max(now);
                    let end = start + chrono::Duration::minutes(capture.duration_minutes());
                    Ok(SchedulingPlan::Start {
                        preferred: Slot::new(start, end),
                    })
                }
                None => Ok(SchedulingPlan::Flexible),
            }
        }
        ConstraintKind::Window => {
            let start = capture.window_start.or(capture.constraint_time);
            let end = capture.window_end.or(capture.constraint_end);
            match (start, end) {
                (Some(start), Some(end)) if end > start => {
                    Ok(SchedulingPlan::Window { start, end })
                }
                _ => Ok(SchedulingPlan::Flexible),
            }
        }
        ConstraintKind::Flexible => Ok(SchedulingPlan::Flexible),
    }
}
