use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::models::config::SchedulerConfig;

pub const MIN_DURATION_MINUTES: i64 = 5;
pub const MAX_DURATION_MINUTES: i64 = 480;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Pending,
    Scheduled,
    Completed,
}

impl CaptureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureStatus::Pending => "pending",
            CaptureStatus::Scheduled => "scheduled",
            CaptureStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "scheduled" => CaptureStatus::Scheduled,
            "completed" => CaptureStatus::Completed,
            _ => CaptureStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Flexible,
    #[serde(alias = "deadline", alias = "end_time")]
    DeadlineTime,
    DeadlineDate,
    StartTime,
    Window,
}

impl ConstraintKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConstraintKind::Flexible => "flexible",
            ConstraintKind::DeadlineTime => "deadline_time",
            ConstraintKind::DeadlineDate => "deadline_date",
            ConstraintKind::StartTime => "start_time",
            ConstraintKind::Window => "window",
        }
    }

    /// Accepts the legacy aliases the capture pipeline still emits.
    pub fn parse(value: &str) -> Self {
        match value {
            "deadline_time" | "deadline" | "end_time" => ConstraintKind::DeadlineTime,
            "deadline_date" => ConstraintKind::DeadlineDate,
            "start_time" => ConstraintKind::StartTime,
            "window" => ConstraintKind::Window,
            _ => ConstraintKind::Flexible,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartFlexibility {
    Soft,
    Hard,
}

impl StartFlexibility {
    pub fn as_str(self) -> &'static str {
        match self {
            StartFlexibility::Soft => "soft",
            StartFlexibility::Hard => "hard",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "hard" => StartFlexibility::Hard,
            _ => StartFlexibility::Soft,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DurationFlexibility {
    Fixed,
    SplitAllowed,
}

impl DurationFlexibility {
    pub fn as_str(self) -> &'static str {
        match self {
            DurationFlexibility::Fixed => "fixed",
            DurationFlexibility::SplitAllowed => "split_allowed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "split_allowed" => DurationFlexibility::SplitAllowed,
            _ => DurationFlexibility::Fixed,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDay {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeOfDay::Morning => "morning",
            TimeOfDay::Afternoon => "afternoon",
            TimeOfDay::Evening => "evening",
            TimeOfDay::Night => "night",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "morning" => Some(TimeOfDay::Morning),
            "afternoon" => Some(TimeOfDay::Afternoon),
            "evening" => Some(TimeOfDay::Evening),
            "night" => Some(TimeOfDay::Night),
            _ => None,
        }
    }

    /// Local [start, end) minutes from midnight. Night spans midnight and
    /// ends at 07:30 the next day.
    pub fn band_minutes(self) -> (i64, i64) {
        match self {
            TimeOfDay::Morning => (8 * 60, 12 * 60),
            TimeOfDay::Afternoon => (12 * 60, 17 * 60),
            TimeOfDay::Evening => (17 * 60, 22 * 60),
            TimeOfDay::Night => (22 * 60, 24 * 60 + 7 * 60 + 30),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutineKind {
    Sleep,
    Meal,
}

impl RoutineKind {
    /// Routine hints live under the `routine.` prefix. Sleep and meal are
    /// the kinds with normalization rules; a hint under the prefix that
    /// names neither is scheduled as an ordinary capture.
    pub fn from_hint(hint: &str) -> Option<Self> {
        match hint.strip_prefix("routine.")? {
            "sleep" => Some(RoutineKind::Sleep),
            "meal" => Some(RoutineKind::Meal),
            _ => None,
        }
    }
}

/// One row of `capture_entries`: the unit of scheduling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRecord {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub estimated_minutes: i64,
    pub importance: i64,
    #[serde(default)]
    pub urgency: Option<f64>,
    #[serde(default)]
    pub impact: Option<f64>,
    #[serde(default)]
    pub reschedule_penalty: Option<f64>,
    pub status: CaptureStatus,
    pub constraint_type: ConstraintKind,
    #[serde(default)]
    pub constraint_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub constraint_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub constraint_date: Option<NaiveDate>,
    #[serde(default)]
    pub original_target_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deadline_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub window_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub window_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_target_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_soft_start: bool,
    #[serde(default)]
    pub cannot_overlap: bool,
    pub start_flexibility: StartFlexibility,
    pub duration_flexibility: DurationFlexibility,
    #[serde(default)]
    pub min_chunk_minutes: Option<i64>,
    #[serde(default)]
    pub max_splits: Option<i64>,
    #[serde(default)]
    pub extraction_kind: Option<String>,
    #[serde(default)]
    pub task_type_hint: Option<String>,
    #[serde(default)]
    pub time_pref_time_of_day: Option<TimeOfDay>,
    #[serde(default)]
    pub time_pref_day: Option<String>,
    #[serde(default)]
    pub externality_score: f64,
    #[serde(default)]
    pub reschedule_count: i64,
    #[serde(default)]
    pub planned_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub planned_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub calendar_event_id: Option<String>,
    #[serde(default)]
    pub calendar_event_etag: Option<String>,
    #[serde(default)]
    pub freeze_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub manual_touch_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduling_notes: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CaptureRecord {
    /// Duration with the [5, 480] clamp applied.
    pub fn duration_minutes(&self) -> i64 {
        self.estimated_minutes
            .clamp(MIN_DURATION_MINUTES, MAX_DURATION_MINUTES)
    }

    pub fn routine_kind(&self) -> Option<RoutineKind> {
        self.task_type_hint
            .as_deref()
            .and_then(RoutineKind::from_hint)
            .or_else(|| {
                self.extraction_kind
                    .as_deref()
                    .and_then(RoutineKind::from_hint)
            })
    }

    pub fn min_chunk(&self, config: &SchedulerConfig) -> i64 {
        self.min_chunk_minutes
            .filter(|minutes| *minutes > 0)
            .unwrap_or(config.default_min_chunk_minutes)
    }

    pub fn allows_split(&self) -> bool {
        self.duration_flexibility == DurationFlexibility::SplitAllowed
    }

    pub fn is_frozen(&self, now: DateTime<Utc>) -> bool {
        self.freeze_until.map(|until| until > now).unwrap_or(false)
    }

    /// Both conditions of the overlap invariant: the capture neither blocks
    /// concurrency nor pins its start.
    pub fn can_overlap(&self) -> bool {
        !self.cannot_overlap && self.start_flexibility != StartFlexibility::Hard
    }

    pub fn notes(&self) -> SchedulingNotes {
        self.scheduling_notes
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set_notes(&mut self, notes: SchedulingNotes) {
        self.scheduling_notes = serde_json::to_value(&notes).ok();
    }

    pub fn clear_placement(&mut self) {
        self.status = CaptureStatus::Pending;
        self.planned_start = None;
        self.planned_end = None;
        self.scheduled_for = None;
        self.calendar_event_id = None;
        self.calendar_event_etag = None;
    }
}

/// Narrow typed projection over the otherwise opaque `scheduling_notes`
/// JSON column. Unknown fields survive a read-modify-write cycle.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingNotes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<ExplanationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_note: Option<JsonValue>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExplanationRecord {
    pub reason: String,
    pub message: String,
    pub generated_at: DateTime<Utc>,
}
