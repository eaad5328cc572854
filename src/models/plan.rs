use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::capture::{CaptureRecord, CaptureStatus};

/// Half-open interval [start, end).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Slot {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &Slot) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// How the slot search should treat a capture. The variant carries exactly
/// the data its search mode needs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum SchedulingPlan {
    Flexible,
    Start { preferred: Slot },
    Window { start: DateTime<Utc>, end: DateTime<Utc> },
    Deadline { deadline: DateTime<Utc> },
}

impl SchedulingPlan {
    pub fn is_deadline_mode(&self) -> bool {
        matches!(self, SchedulingPlan::Deadline { .. })
    }

    pub fn window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match self {
            SchedulingPlan::Window { start, end } => Some((*start, *end)),
            _ => None,
        }
    }

    pub fn preferred_slot(&self) -> Option<Slot> {
        match self {
            SchedulingPlan::Start { preferred } => Some(*preferred),
            _ => None,
        }
    }

    pub fn mode_label(&self) -> &'static str {
        match self {
            SchedulingPlan::Flexible => "flexible",
            SchedulingPlan::Start { .. } => "start",
            SchedulingPlan::Window { .. } => "window",
            SchedulingPlan::Deadline { .. } => "deadline",
        }
    }
}

/// One committed segment of a capture's placement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub prime: bool,
    #[serde(default)]
    pub late: bool,
    #[serde(default)]
    pub overlapped: bool,
}

impl ChunkRecord {
    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanActionKind {
    Scheduled,
    Rescheduled,
    Unscheduled,
}

impl PlanActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanActionKind::Scheduled => "scheduled",
            PlanActionKind::Rescheduled => "rescheduled",
            PlanActionKind::Unscheduled => "unscheduled",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "rescheduled" => PlanActionKind::Rescheduled,
            "unscheduled" => PlanActionKind::Unscheduled,
            _ => PlanActionKind::Scheduled,
        }
    }
}

/// Value snapshot of the placement-bearing capture fields, taken before and
/// after each mutation. No back-references into live records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSnapshot {
    pub status: CaptureStatus,
    #[serde(default)]
    pub planned_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub planned_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub calendar_event_id: Option<String>,
    #[serde(default)]
    pub calendar_event_etag: Option<String>,
    #[serde(default)]
    pub freeze_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub plan_id: Option<String>,
}

impl PlacementSnapshot {
    pub fn of(capture: &CaptureRecord) -> Self {
        Self {
            status: capture.status,
            planned_start: capture.planned_start,
            planned_end: capture.planned_end,
            calendar_event_id: capture.calendar_event_id.clone(),
            calendar_event_etag: capture.calendar_event_etag.clone(),
            freeze_until: capture.freeze_until,
            plan_id: capture.plan_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanAction {
    pub action_id: String,
    pub capture_id: String,
    pub capture_content: String,
    pub kind: PlanActionKind,
    pub prev: PlacementSnapshot,
    pub next: PlacementSnapshot,
}

/// Audit scope of one scheduling request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanRun {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}
