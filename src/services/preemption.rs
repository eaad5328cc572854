use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::calendar::CalendarEvent;
use crate::models::capture::CaptureRecord;
use crate::models::config::SchedulerConfig;
use crate::models::plan::Slot;
use crate::services::busy::{compute_busy_intervals, is_slot_free};
use crate::services::priority::per_minute_priority;

/// Outcome of the minimal-set search: which owned events to remove, and
/// whether the compressed buffer was needed to make the slot fit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedPreemption {
    pub event_ids: Vec<String>,
    pub compressed_buffer: bool,
}

/// Smallest combination of candidate owned events whose removal makes the
/// slot feasible. Combinations are tried by ascending size (1..=4 by
/// default), bounded by the configured combination budget; within a size,
/// full-buffer feasibility is preferred over compressed.
pub fn select_minimal_preemption_set(
    slot: Slot,
    events: &[CalendarEvent],
    candidate_ids: &[String],
    allow_compressed_buffer: bool,
    now: DateTime<Utc>,
    offset_minutes: i32,
    config: &SchedulerConfig,
) -> Option<SelectedPreemption> {
    let max_size = config
        .preemption
        .max_combination_size
        .min(candidate_ids.len())
        .max(1);
    let mut budget = config.preemption.max_combinations;

    for size in 1..=max_size {
        let mut indices: Vec<usize> = (0..size).collect();
        loop {
            if budget == 0 {
                return None;
            }
            budget -= 1;

            let combo: Vec<&str> = indices
                .iter()
                .map(|index| candidate_ids[*index].as_str())
                .collect();
            let remaining: Vec<CalendarEvent> = events
                .iter()
                .filter(|event| !combo.contains(&event.id.as_str()))
                .cloned()
                .collect();

            let full =
                compute_busy_intervals(&remaining, config.buffer_minutes, now, offset_minutes);
            if is_slot_free(slot.start, slot.end, &full) {
                return Some(SelectedPreemption {
                    event_ids: combo.iter().map(|id| id.to_string()).collect(),
                    compressed_buffer: false,
                });
            }

            if allow_compressed_buffer {
                let compressed = compute_busy_intervals(
                    &remaining,
                    config.compressed_buffer_minutes,
                    now,
                    offset_minutes,
                );
                if is_slot_free(slot.start, slot.end, &compressed) {
                    return Some(SelectedPreemption {
                        event_ids: combo.iter().map(|id| id.to_string()).collect(),
                        compressed_buffer: true,
                    });
                }
            }

            if !advance_combination(&mut indices, candidate_ids.len()) {
                break;
            }
        }
    }

    None
}

fn advance_combination(indices: &mut [usize], n: usize) -> bool {
    let k = indices.len();
    let mut i = k;
    while i > 0 {
        i -= 1;
        if indices[i] < n - (k - i) {
            indices[i] += 1;
            for j in i + 1..k {
                indices[j] = indices[j - 1] + 1;
            }
            return true;
        }
    }
    false
}

/// One displaced capture and the minutes it loses to the target.
#[derive(Debug, Clone)]
pub struct Displacement {
    pub capture: CaptureRecord,
    pub minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetGain {
    pub benefit: f64,
    pub cost: f64,
    pub net: f64,
    pub per_minute: f64,
    pub allowed: bool,
}

/// Cost/benefit of displacing `displacements` in favor of `target`.
/// Benefit is the target's per-minute priority over the claimed minutes;
/// cost sums each displaced capture's per-minute priority over its lost
/// minutes plus a flat friction term per displacement.
pub fn evaluate_preemption_net_gain(
    target: &CaptureRecord,
    displacements: &[Displacement],
    minutes_claimed: i64,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> NetGain {
    let benefit = per_minute_priority(target, now, config) * minutes_claimed as f64;

    let mut cost = 0.0;
    let mut displaced_minutes = 0;
    for displacement in displacements {
        cost += per_minute_priority(&displacement.capture, now, config)
            * displacement.minutes as f64
            + config.preemption.displacement_friction;
        displaced_minutes += displacement.minutes;
    }

    let net = benefit - cost;
    let per_minute = net / minutes_claimed.max(1) as f64;

    let policy = &config.preemption;
    let allowed = net >= policy.net_gain_floor
        && per_minute >= policy.per_minute_gain_floor
        && displaced_minutes <= policy.max_displaced_minutes
        && displacements.len() <= policy.max_displaced_tasks;

    debug!(
        target: "engine::preemption",
        target_capture = %target.id,
        displaced = displacements.len(),
        benefit,
        cost,
        net,
        allowed,
        "evaluated preemption net gain"
    );

    NetGain {
        benefit,
        cost,
        net,
        per_minute,
        allowed,
    }
}

/// A blocker inside the stability window (about to start, or already
/// running) is immune to displacement unless the target plan is
/// deadline-bound.
pub fn is_stable(capture: &CaptureRecord, now: DateTime<Utc>, config: &SchedulerConfig) -> bool {
    match (capture.planned_start, capture.planned_end) {
        (Some(start), Some(end)) => {
            start <= now + Duration::minutes(config.stability_window_minutes) && end > now
        }
        _ => false,
    }
}

pub fn is_movable(
    capture: &CaptureRecord,
    now: DateTime<Utc>,
    bypass_stability: bool,
    config: &SchedulerConfig,
) -> bool {
    if capture.is_frozen(now) {
        return false;
    }
    bypass_stability || !is_stable(capture, now, config)
}
