use chrono::{DateTime, Utc};

use crate::models::capture::{CaptureRecord, RoutineKind};
use crate::models::config::SchedulerConfig;

const IMPORTANCE_WEIGHT: f64 = 12.0;
const URGENCY_WEIGHT: f64 = 15.0;
const IMPACT_WEIGHT: f64 = 15.0;
const PENALTY_WEIGHT: f64 = 10.0;
const DEADLINE_PRESSURE_CAP: f64 = 30.0;
const DEADLINE_RAMP_HOURS: f64 = 72.0;
const AGE_PER_DAY: f64 = 1.5;
const AGE_CAP: f64 = 9.0;

/// Non-negative score of a capture at a reference time. Higher wins when
/// preemption and overlap weigh one capture against another.
pub fn priority_score(capture: &CaptureRecord, now: DateTime<Utc>, config: &SchedulerConfig) -> f64 {
    let importance = capture.importance.clamp(1, 5) as f64 * IMPORTANCE_WEIGHT;
    let urgency = capture.urgency.unwrap_or(0.0).clamp(0.0, 1.0) * URGENCY_WEIGHT;
    let impact = capture.impact.unwrap_or(0.0).clamp(0.0, 1.0) * IMPACT_WEIGHT;
    let penalty = capture
        .reschedule_penalty
        .unwrap_or(0.0)
        .clamp(0.0, 1.0)
        * PENALTY_WEIGHT;

    let deadline_pressure = match effective_deadline(capture) {
        Some(deadline) => {
            let hours_left = (deadline - now).num_minutes() as f64 / 60.0;
            if hours_left <= 0.0 {
                DEADLINE_PRESSURE_CAP
            } else {
                ((DEADLINE_RAMP_HOURS - hours_left).max(0.0) / DEADLINE_RAMP_HOURS)
                    * DEADLINE_PRESSURE_CAP
            }
        }
        None => 0.0,
    };

    let age_days = (now - capture.created_at).num_days().max(0) as f64;
    let age = (age_days * AGE_PER_DAY).min(AGE_CAP);

    let base = importance + urgency + impact + penalty + deadline_pressure + age;

    let multiplier = 1.0
        + capture.externality_score.clamp(0.0, 1.0) * 0.15
        + capture.reschedule_count.clamp(0, 5) as f64 * 0.04;

    let score = base * multiplier;

    match capture.routine_kind() {
        Some(RoutineKind::Sleep) => {
            (score * config.sleep_priority.scale).min(config.sleep_priority.cap)
        }
        Some(RoutineKind::Meal) => {
            (score * config.meal_priority.scale).min(config.meal_priority.cap)
        }
        None => score,
    }
}

/// Score spread over the capture's duration; the unit preemption and
/// overlap trade in.
pub fn per_minute_priority(
    capture: &CaptureRecord,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> f64 {
    priority_score(capture, now, config) / capture.duration_minutes().max(1) as f64
}

fn effective_deadline(capture: &CaptureRecord) -> Option<DateTime<Utc>> {
    capture.deadline_at.or(capture.window_end)
}
