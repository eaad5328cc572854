#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use diaguru_engine::db::DbPool;
use diaguru_engine::error::{ScheduleError, ScheduleResult};
use diaguru_engine::models::calendar::{
    CalendarEvent, EventDraft, EventTime, CAPTURE_ID_KEY, OWNED_MARKER_KEY,
};
use diaguru_engine::models::capture::{
    CaptureRecord, CaptureStatus, ConstraintKind, DurationFlexibility, StartFlexibility,
};
use diaguru_engine::models::config::SchedulerConfig;
use diaguru_engine::services::advisor::ConflictAdvisor;
use diaguru_engine::services::calendar_gateway::CalendarGateway;
use diaguru_engine::services::clock::FixedClock;
use diaguru_engine::services::scheduler_service::SchedulerService;

pub const USER_ID: &str = "user-1";

#[derive(Default)]
struct GatewayState {
    events: Vec<CalendarEvent>,
    next_id: u64,
    fail_next_delete_with_stale_etag: bool,
    deleted: Vec<String>,
}

/// In-memory calendar double with the same status-code contract as the
/// real provider: 412 on stale etags, events keyed by opaque ids.
pub struct MockCalendarGateway {
    state: Mutex<GatewayState>,
}

impl MockCalendarGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GatewayState::default()),
        })
    }

    pub fn seed_external(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        let mut state = self.state.lock().expect("gateway lock");
        state.next_id += 1;
        let id = format!("ext-{}", state.next_id);
        state.events.push(CalendarEvent {
            id: id.clone(),
            summary: Some("busy".into()),
            etag: Some("v1".into()),
            start: EventTime::DateTime(start),
            end: EventTime::DateTime(end),
            private_properties: BTreeMap::new(),
        });
        id
    }

    pub fn seed_owned(
        &self,
        capture_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> String {
        let mut state = self.state.lock().expect("gateway lock");
        state.next_id += 1;
        let id = format!("own-{}", state.next_id);
        let mut private_properties = BTreeMap::new();
        private_properties.insert(OWNED_MARKER_KEY.to_string(), "true".to_string());
        private_properties.insert(CAPTURE_ID_KEY.to_string(), capture_id.to_string());
        state.events.push(CalendarEvent {
            id: id.clone(),
            summary: Some(format!("[DG] {capture_id}")),
            etag: Some("v1".into()),
            start: EventTime::DateTime(start),
            end: EventTime::DateTime(end),
            private_properties,
        });
        id
    }

    pub fn fail_next_delete_with_stale_etag(&self) {
        self.state
            .lock()
            .expect("gateway lock")
            .fail_next_delete_with_stale_etag = true;
    }

    pub fn events(&self) -> Vec<CalendarEvent> {
        self.state.lock().expect("gateway lock").events.clone()
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.state.lock().expect("gateway lock").deleted.clone()
    }
}

#[async_trait]
impl CalendarGateway for MockCalendarGateway {
    async fn list_events(
        &self,
        _user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ScheduleResult<Vec<CalendarEvent>> {
        let state = self.state.lock().expect("gateway lock");
        Ok(state
            .events
            .iter()
            .filter(|event| {
                let start = event.start_instant(0);
                let end = event.end_instant(0);
                start < to && from < end
            })
            .cloned()
            .collect())
    }

    async fn create_event(
        &self,
        _user_id: &str,
        draft: &EventDraft,
    ) -> ScheduleResult<CalendarEvent> {
        let mut state = self.state.lock().expect("gateway lock");
        state.next_id += 1;
        let event = CalendarEvent {
            id: format!("evt-{}", state.next_id),
            summary: Some(draft.summary.clone()),
            etag: Some("v1".into()),
            start: EventTime::DateTime(draft.start),
            end: EventTime::DateTime(draft.end),
            private_properties: draft.private_properties.clone(),
        };
        state.events.push(event.clone());
        Ok(event)
    }

    async fn delete_event(
        &self,
        _user_id: &str,
        event_id: &str,
        etag: Option<&str>,
    ) -> ScheduleResult<()> {
        let mut state = self.state.lock().expect("gateway lock");
        if state.fail_next_delete_with_stale_etag {
            state.fail_next_delete_with_stale_etag = false;
            return Err(ScheduleError::precondition_failed("stale version tag"));
        }

        let Some(index) = state.events.iter().position(|event| event.id == event_id) else {
            return Err(ScheduleError::NotFound);
        };
        if let (Some(sent), Some(current)) = (etag, state.events[index].etag.as_deref()) {
            if sent != current {
                return Err(ScheduleError::precondition_failed("stale version tag"));
            }
        }
        state.events.remove(index);
        state.deleted.push(event_id.to_string());
        Ok(())
    }

    async fn get_event(&self, _user_id: &str, event_id: &str) -> ScheduleResult<CalendarEvent> {
        let state = self.state.lock().expect("gateway lock");
        state
            .events
            .iter()
            .find(|event| event.id == event_id)
            .cloned()
            .ok_or(ScheduleError::NotFound)
    }

    async fn refresh_auth(&self, _user_id: &str) -> ScheduleResult<()> {
        Ok(())
    }
}

pub fn test_pool(dir: &tempfile::TempDir) -> DbPool {
    DbPool::new(dir.path().join("engine.sqlite")).expect("db pool")
}

pub fn test_service(
    pool: DbPool,
    gateway: Arc<MockCalendarGateway>,
    advisor: Option<Arc<dyn ConflictAdvisor>>,
    now: DateTime<Utc>,
) -> SchedulerService {
    SchedulerService::new(
        pool,
        gateway,
        advisor,
        Arc::new(FixedClock(now)),
        SchedulerConfig::default(),
    )
}

pub fn pending_capture(id: &str, now: DateTime<Utc>) -> CaptureRecord {
    CaptureRecord {
        id: id.into(),
        user_id: USER_ID.into(),
        content: format!("task {id}"),
        estimated_minutes: 60,
        importance: 1,
        urgency: None,
        impact: None,
        reschedule_penalty: None,
        status: CaptureStatus::Pending,
        constraint_type: ConstraintKind::Flexible,
        constraint_time: None,
        constraint_end: None,
        constraint_date: None,
        original_target_time: None,
        deadline_at: None,
        window_start: None,
        window_end: None,
        start_target_at: None,
        is_soft_start: false,
        cannot_overlap: false,
        start_flexibility: StartFlexibility::Soft,
        duration_flexibility: DurationFlexibility::Fixed,
        min_chunk_minutes: None,
        max_splits: None,
        extraction_kind: None,
        task_type_hint: None,
        time_pref_time_of_day: None,
        time_pref_day: None,
        externality_score: 0.0,
        reschedule_count: 0,
        planned_start: None,
        planned_end: None,
        scheduled_for: None,
        calendar_event_id: None,
        calendar_event_etag: None,
        freeze_until: None,
        plan_id: None,
        manual_touch_at: None,
        scheduling_notes: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    chrono::NaiveDate::from_ymd_opt(y, mo, d)
        .expect("date")
        .and_hms_opt(h, mi, 0)
        .expect("time")
        .and_utc()
}
