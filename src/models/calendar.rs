use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const OWNED_MARKER_KEY: &str = "diaGuru";
pub const CAPTURE_ID_KEY: &str = "capture_id";
pub const ACTION_ID_KEY: &str = "action_id";
pub const PRIORITY_SNAPSHOT_KEY: &str = "priority_snapshot";
pub const PLAN_ID_KEY: &str = "plan_id";

const SUMMARY_PREFIX: &str = "[DG] ";
const SUMMARY_MAX_CHARS: usize = 200;

/// Provider event times are either a wall datetime or an all-day date.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", untagged)]
pub enum EventTime {
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
}

impl EventTime {
    /// Resolve to an instant. All-day dates map to local midnight via the
    /// user's offset (minutes east of UTC).
    pub fn instant(&self, offset_minutes: i32) -> DateTime<Utc> {
        match self {
            EventTime::DateTime(dt) => *dt,
            EventTime::Date(date) => {
                let midnight = date
                    .and_hms_opt(0, 0, 0)
                    .expect("midnight is always a valid wall time")
                    .and_utc();
                midnight - Duration::minutes(i64::from(offset_minutes))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    #[serde(default)]
    pub summary: Option<String>,
    /// Opaque version tag; must be echoed as a precondition on delete.
    #[serde(default)]
    pub etag: Option<String>,
    pub start: EventTime,
    pub end: EventTime,
    #[serde(default)]
    pub private_properties: BTreeMap<String, String>,
}

impl CalendarEvent {
    pub fn is_owned(&self) -> bool {
        self.private_properties
            .get(OWNED_MARKER_KEY)
            .map(|value| value == "true")
            .unwrap_or(false)
    }

    pub fn capture_id(&self) -> Option<&str> {
        if self.is_owned() {
            self.private_properties.get(CAPTURE_ID_KEY).map(String::as_str)
        } else {
            None
        }
    }

    pub fn start_instant(&self, offset_minutes: i32) -> DateTime<Utc> {
        self.start.instant(offset_minutes)
    }

    pub fn end_instant(&self, offset_minutes: i32) -> DateTime<Utc> {
        self.end.instant(offset_minutes)
    }
}

/// Payload for `CalendarGateway::create_event`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventDraft {
    pub summary: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub private_properties: BTreeMap<String, String>,
}

impl EventDraft {
    /// Owned-event wire shape: prefixed truncated summary plus the marker
    /// properties the reconciler keys on.
    pub fn owned(
        content: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        capture_id: &str,
        action_id: &str,
        priority_snapshot: f64,
        plan_id: Option<&str>,
    ) -> Self {
        let mut summary = format!("{SUMMARY_PREFIX}{content}");
        if summary.chars().count() > SUMMARY_MAX_CHARS {
            summary = summary.chars().take(SUMMARY_MAX_CHARS).collect();
        }

        let mut private_properties = BTreeMap::new();
        private_properties.insert(OWNED_MARKER_KEY.to_string(), "true".to_string());
        private_properties.insert(CAPTURE_ID_KEY.to_string(), capture_id.to_string());
        private_properties.insert(ACTION_ID_KEY.to_string(), action_id.to_string());
        private_properties.insert(
            PRIORITY_SNAPSHOT_KEY.to_string(),
            format!("{priority_snapshot:.2}"),
        );
        if let Some(plan_id) = plan_id {
            private_properties.insert(PLAN_ID_KEY.to_string(), plan_id.to_string());
        }

        Self {
            summary,
            start,
            end,
            private_properties,
        }
    }
}
