use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::models::capture::CaptureRecord;
use crate::models::plan::{ChunkRecord, Slot};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleAction {
    Schedule,
    Reschedule,
    Complete,
}

/// Body of `POST /schedule-capture`. Field names and the boolean aliases
/// match what existing clients send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleCaptureRequest {
    pub capture_id: String,
    pub action: ScheduleAction,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub timezone_offset_minutes: Option<i32>,
    #[serde(default)]
    pub preferred_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub preferred_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub allow_overlap: bool,
    #[serde(default, alias = "allowPreemption")]
    pub allow_rebalance: bool,
    #[serde(default, alias = "allowLate", alias = "scheduleLate")]
    pub allow_late_placement: bool,
}

impl ScheduleCaptureRequest {
    pub fn schedule(capture_id: impl Into<String>) -> Self {
        Self {
            capture_id: capture_id.into(),
            action: ScheduleAction::Schedule,
            timezone: None,
            timezone_offset_minutes: None,
            preferred_start: None,
            preferred_end: None,
            allow_overlap: false,
            allow_rebalance: false,
            allow_late_placement: false,
        }
    }

    pub fn preferred_slot(&self) -> Option<Slot> {
        match (self.preferred_start, self.preferred_end) {
            (Some(start), Some(end)) if end > start => Some(Slot::new(start, end)),
            _ => None,
        }
    }
}

/// One conflicting calendar event, as surfaced to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSummary {
    pub event_id: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub owned: bool,
    #[serde(default)]
    pub capture_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdvisorAction {
    SuggestSlot,
    AskOverlap,
    Defer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdvisorDecision {
    pub action: AdvisorAction,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<Slot>,
}

/// Returned when no automatic commit was possible for a preferred slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDecision {
    #[serde(rename = "type")]
    pub decision_type: String,
    pub message: String,
    pub preferred: Slot,
    pub conflicts: Vec<ConflictSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<Slot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisor: Option<AdvisorDecision>,
    pub metadata: JsonValue,
}

impl ConflictDecision {
    pub const PREFERRED_CONFLICT: &'static str = "preferred_conflict";
}

/// Overlap bookkeeping echoed back on an overlapped commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OverlapReport {
    pub with_capture_ids: Vec<String>,
    pub slot_minutes: i64,
    pub daily_used_minutes: i64,
    pub daily_budget_minutes: i64,
    pub prime_capture_id: String,
}

/// The 200 body: either a commit (chunks present) or a conflict decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResponse {
    pub message: String,
    pub capture: CaptureRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<ChunkRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap: Option<OverlapReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ConflictDecision>,
}
