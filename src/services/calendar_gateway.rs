use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ScheduleResult;
use crate::models::calendar::{CalendarEvent, EventDraft};

/// Abstract calendar provider. Authentication and token lifecycle live
/// behind the implementation; the engine only sees the status codes.
///
/// Contract the orchestrator depends on:
/// - `delete_event` must honor the etag precondition and fail with
///   status 412 when the tag is stale;
/// - a 401 from any operation may be retried exactly once after
///   `refresh_auth` succeeds;
/// - `create_event` is never retried by callers (double-booking hazard),
///   so implementations must not auto-retry internally either.
#[async_trait]
pub trait CalendarGateway: Send + Sync {
    async fn list_events(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ScheduleResult<Vec<CalendarEvent>>;

    async fn create_event(
        &self,
        user_id: &str,
        draft: &EventDraft,
    ) -> ScheduleResult<CalendarEvent>;

    async fn delete_event(
        &self,
        user_id: &str,
        event_id: &str,
        etag: Option<&str>,
    ) -> ScheduleResult<()>;

    async fn get_event(&self, user_id: &str, event_id: &str) -> ScheduleResult<CalendarEvent>;

    async fn refresh_auth(&self, user_id: &str) -> ScheduleResult<()>;
}
