mod support;

use std::sync::Arc;

use diaguru_engine::db::repositories::capture_repository::CaptureRepository;
use diaguru_engine::db::repositories::plan_repository::PlanRepository;
use diaguru_engine::models::capture::{CaptureStatus, ConstraintKind, DurationFlexibility};
use diaguru_engine::models::config::AdvisorConfig;
use diaguru_engine::models::outcome::ScheduleCaptureRequest;
use diaguru_engine::models::plan::PlanActionKind;
use diaguru_engine::services::advisor::{ConflictAdvisor, HttpConflictAdvisor};
use httpmock::prelude::*;
use support::{pending_capture, test_pool, test_service, utc, MockCalendarGateway, USER_ID};
use tempfile::tempdir;

#[tokio::test]
async fn sleep_capture_normalizes_to_tonight_in_chicago_and_schedules() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 11, 21, 16, 46);

    let mut capture = pending_capture("cap-sleep", now);
    capture.content = "sleep".into();
    capture.estimated_minutes = 480;
    capture.task_type_hint = Some("routine.sleep".into());
    capture.time_pref_day = Some("tomorrow".into());
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&capture))
        .expect("insert capture");

    let service = test_service(pool.clone(), gateway.clone(), None, now);
    let mut request = ScheduleCaptureRequest::schedule("cap-sleep");
    request.timezone = Some("America/Chicago".into());

    let response = service.handle_request(USER_ID, request).await.expect("schedule");

    // Normalized night window: 22:00 CST tonight through 07:30 tomorrow.
    let stored = pool
        .with_connection(|conn| CaptureRepository::new(conn).find_by_id("cap-sleep"))
        .expect("load")
        .expect("capture");
    assert_eq!(stored.constraint_type, ConstraintKind::Window);
    assert_eq!(stored.window_start, Some(utc(2025, 11, 22, 4, 0)));
    assert_eq!(stored.window_end, Some(utc(2025, 11, 22, 13, 30)));
    assert!(stored.cannot_overlap);
    assert_eq!(stored.duration_flexibility, DurationFlexibility::Fixed);
    assert_eq!(stored.deadline_at, stored.window_end);

    // Placement starts right at the window opening, outside working hours.
    assert_eq!(response.capture.planned_start, Some(utc(2025, 11, 22, 4, 0)));
    assert_eq!(response.capture.planned_end, Some(utc(2025, 11, 22, 12, 0)));
    assert_eq!(response.capture.status, CaptureStatus::Scheduled);
}

#[tokio::test]
async fn commit_writes_the_full_audit_trail() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 5, 5, 9, 0);

    let capture = pending_capture("cap-audit", now);
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&capture))
        .expect("insert capture");

    let service = test_service(pool.clone(), gateway, None, now);
    let response = service
        .handle_request(USER_ID, ScheduleCaptureRequest::schedule("cap-audit"))
        .await
        .expect("schedule");

    let run_id = response.capture.plan_id.clone().expect("plan id");
    let (run, actions) = pool
        .with_connection(|conn| {
            let repo = PlanRepository::new(conn);
            let run = repo.find_run(&run_id)?.ok_or_else(|| {
                diaguru_engine::error::ScheduleError::internal("missing plan run")
            })?;
            let actions = repo.list_actions(&run_id)?;
            Ok((run, actions))
        })
        .expect("audit rows");

    assert_eq!(run.user_id, USER_ID);
    assert_eq!(run.summary.as_deref(), Some("scheduled:1 moved:0 unscheduled:0"));
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].kind, PlanActionKind::Scheduled);
    assert_eq!(actions[0].capture_id, "cap-audit");
    assert_eq!(actions[0].prev.status, CaptureStatus::Pending);
    assert_eq!(actions[0].next.status, CaptureStatus::Scheduled);
    assert_eq!(actions[0].prev.calendar_event_id, None);
    assert!(actions[0].next.calendar_event_id.is_some());
    assert_eq!(actions[0].next.plan_id.as_deref(), Some(run_id.as_str()));
}

#[tokio::test]
async fn split_capture_chunks_around_busy_blocks_before_the_deadline() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 5, 5, 9, 0);

    // Two meetings leave no contiguous hour before the 13:00 deadline.
    gateway.seed_external(utc(2025, 5, 5, 10, 0), utc(2025, 5, 5, 10, 30));
    gateway.seed_external(utc(2025, 5, 5, 11, 30), utc(2025, 5, 5, 12, 0));

    let mut capture = pending_capture("cap-split", now);
    capture.constraint_type = ConstraintKind::DeadlineTime;
    capture.constraint_time = Some(utc(2025, 5, 5, 13, 0));
    capture.duration_flexibility = DurationFlexibility::SplitAllowed;
    capture.min_chunk_minutes = Some(30);
    capture.max_splits = Some(2);
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&capture))
        .expect("insert capture");

    let service = test_service(pool, gateway.clone(), None, now);
    let response = service
        .handle_request(USER_ID, ScheduleCaptureRequest::schedule("cap-split"))
        .await
        .expect("chunked placement");

    assert_eq!(response.chunks.len(), 2);
    let total: i64 = response.chunks.iter().map(|chunk| chunk.minutes()).sum();
    assert_eq!(total, 60);
    assert!(response.chunks.iter().all(|chunk| chunk.minutes() >= 30));
    assert!(response.chunks.iter().all(|chunk| !chunk.late));
    assert!(response.chunks[1].start >= response.chunks[0].end);
    assert!(response.chunks[1].end <= utc(2025, 5, 5, 13, 0));

    // One spanning event covers the whole placement.
    assert_eq!(response.capture.planned_start, Some(response.chunks[0].start));
    assert_eq!(response.capture.planned_end, Some(response.chunks[1].end));
}

#[tokio::test]
async fn advisor_opinion_is_attached_and_failures_are_suppressed() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 5, 5, 9, 0);

    gateway.seed_external(utc(2025, 5, 5, 10, 0), utc(2025, 5, 5, 11, 0));
    for id in ["cap-adv", "cap-adv-2"] {
        let capture = pending_capture(id, now);
        pool.with_connection(|conn| CaptureRepository::new(conn).insert(&capture))
            .expect("insert capture");
    }

    let server = MockServer::start_async().await;
    let healthy = server
        .mock_async(|when, then| {
            when.method(POST).path("/advise");
            then.status(200).json_body(serde_json::json!({
                "action": "defer",
                "message": "Leave the meeting in place and take the next free hour."
            }));
        })
        .await;

    let advisor: Arc<dyn ConflictAdvisor> = Arc::new(
        HttpConflictAdvisor::try_new(&AdvisorConfig {
            endpoint: server.url("/advise"),
            api_key: None,
            timeout_secs: 5,
        })
        .expect("advisor"),
    );
    let service = test_service(pool.clone(), gateway.clone(), Some(advisor), now);

    let mut request = ScheduleCaptureRequest::schedule("cap-adv");
    request.preferred_start = Some(utc(2025, 5, 5, 10, 0));
    request.preferred_end = Some(utc(2025, 5, 5, 11, 0));

    let response = service.handle_request(USER_ID, request).await.expect("decision");
    let decision = response.decision.expect("decision");
    let opinion = decision.advisor.expect("advisor opinion");
    assert_eq!(opinion.message, "Leave the meeting in place and take the next free hour.");
    healthy.assert_async().await;

    // A failing advisor never blocks the decision.
    healthy.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/advise");
            then.status(500);
        })
        .await;

    let mut request = ScheduleCaptureRequest::schedule("cap-adv-2");
    request.preferred_start = Some(utc(2025, 5, 5, 10, 0));
    request.preferred_end = Some(utc(2025, 5, 5, 11, 0));

    let response = service.handle_request(USER_ID, request).await.expect("decision");
    let decision = response.decision.expect("decision");
    assert!(decision.advisor.is_none());
    assert!(!decision.message.is_empty());
}
