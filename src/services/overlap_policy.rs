use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::calendar::CalendarEvent;
use crate::models::capture::CaptureRecord;
use crate::models::config::SchedulerConfig;
use crate::models::plan::Slot;
use crate::services::priority::per_minute_priority;
use crate::services::time_utils;

/// Request-local meter of concurrent-owned minutes per UTC day. Seeded from
/// the live calendar on every invocation; nothing is persisted across
/// requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OverlapMeter {
    used_by_day: BTreeMap<String, i64>,
}

impl OverlapMeter {
    /// Minutes during which at least two owned events coincide, bucketed by
    /// the UTC date the overlap starts on.
    pub fn from_events(events: &[CalendarEvent], offset_minutes: i32) -> Self {
        let mut boundaries: Vec<(DateTime<Utc>, i64)> = Vec::new();
        for event in events.iter().filter(|event| event.is_owned()) {
            let start = event.start_instant(offset_minutes);
            let end = event.end_instant(offset_minutes);
            if end > start {
                boundaries.push((start, 1));
                boundaries.push((end, -1));
            }
        }
        boundaries.sort();

        let mut used_by_day: BTreeMap<String, i64> = BTreeMap::new();
        let mut active = 0i64;
        let mut overlap_since: Option<DateTime<Utc>> = None;
        for (at, delta) in boundaries {
            let was_overlapping = active >= 2;
            active += delta;
            let is_overlapping = active >= 2;
            match (was_overlapping, is_overlapping) {
                (false, true) => overlap_since = Some(at),
                (true, false) => {
                    if let Some(since) = overlap_since.take() {
                        let minutes = (at - since).num_minutes();
                        if minutes > 0 {
                            *used_by_day.entry(time_utils::day_key(since)).or_insert(0) +=
                                minutes;
                        }
                    }
                }
                _ => {}
            }
        }

        Self { used_by_day }
    }

    pub fn used(&self, day_key: &str) -> i64 {
        self.used_by_day.get(day_key).copied().unwrap_or(0)
    }

    pub fn charge(&mut self, day_key: &str, minutes: i64) {
        *self.used_by_day.entry(day_key.to_string()).or_insert(0) += minutes.max(0);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OverlapEvaluation {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
    pub benefit: f64,
    pub soft_cost: f64,
    pub day_key: String,
    pub slot_minutes: i64,
}

/// Admission control for co-scheduling `target` on top of `co_scheduled`
/// at `slot`. Every gate must pass; the first failure names the rejection.
pub fn evaluate_overlap(
    target: &CaptureRecord,
    co_scheduled: &[CaptureRecord],
    slot: Slot,
    meter: &OverlapMeter,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> OverlapEvaluation {
    let policy = &config.overlap;
    let slot_minutes = slot.minutes();
    let day_key = time_utils::day_key(slot.start);
    let benefit = per_minute_priority(target, now, config) * slot_minutes as f64;
    let soft_cost = policy.soft_cost_per_minute * slot_minutes as f64;

    let rejection = if !policy.enabled {
        Some("overlap_disabled".to_string())
    } else if !target.can_overlap() {
        Some("target_blocks_overlap".to_string())
    } else if let Some(blocking) = co_scheduled.iter().find(|capture| !capture.can_overlap()) {
        Some(format!("conflict_blocks_overlap:{}", blocking.id))
    } else if co_scheduled.len() + 1 > policy.max_concurrency {
        Some("max_concurrency".to_string())
    } else if slot_minutes as f64
        > policy.per_task_overlap_fraction * target.duration_minutes() as f64
    {
        Some("per_task_fraction".to_string())
    } else if meter.used(&day_key) + slot_minutes > policy.daily_budget_minutes {
        Some("daily_budget".to_string())
    } else if benefit <= soft_cost {
        Some("insufficient_benefit".to_string())
    } else {
        None
    };

    debug!(
        target: "engine::overlap",
        capture = %target.id,
        conflicts = co_scheduled.len(),
        slot_minutes,
        day = %day_key,
        allowed = rejection.is_none(),
        "evaluated overlap admission"
    );

    OverlapEvaluation {
        allowed: rejection.is_none(),
        rejection,
        benefit,
        soft_cost,
        day_key,
        slot_minutes,
    }
}

/// The highest-priority participant carries the prime flag on its chunks.
pub fn prime_participant_id(
    participants: &[&CaptureRecord],
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> Option<String> {
    participants
        .iter()
        .max_by(|a, b| {
            crate::services::priority::priority_score(a, now, config)
                .partial_cmp(&crate::services::priority::priority_score(b, now, config))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|capture| capture.id.clone())
}
