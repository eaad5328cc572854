mod support;

use diaguru_engine::db::repositories::capture_repository::CaptureRepository;
use diaguru_engine::db::repositories::chunk_repository::ChunkRepository;
use diaguru_engine::error::ScheduleError;
use diaguru_engine::models::capture::{CaptureStatus, ConstraintKind};
use diaguru_engine::models::outcome::{ScheduleAction, ScheduleCaptureRequest};
use support::{pending_capture, test_pool, test_service, utc, MockCalendarGateway, USER_ID};
use tempfile::tempdir;

#[tokio::test]
async fn window_capture_lands_on_the_earliest_window_slot() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 1, 1, 9, 0);

    let mut capture = pending_capture("cap-window", now);
    capture.constraint_type = ConstraintKind::Window;
    capture.constraint_time = Some(utc(2025, 1, 1, 10, 0));
    capture.constraint_end = Some(utc(2025, 1, 1, 12, 0));
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&capture))
        .expect("insert capture");

    let service = test_service(pool.clone(), gateway.clone(), None, now);
    let response = service
        .handle_request(USER_ID, ScheduleCaptureRequest::schedule("cap-window"))
        .await
        .expect("schedule");

    assert_eq!(response.capture.status, CaptureStatus::Scheduled);
    assert_eq!(response.capture.planned_start, Some(utc(2025, 1, 1, 10, 0)));
    assert_eq!(response.capture.planned_end, Some(utc(2025, 1, 1, 11, 0)));
    assert_eq!(response.chunks.len(), 1);
    assert!(!response.chunks[0].late);
    assert_eq!(
        response.plan_summary.as_deref(),
        Some("scheduled:1 moved:0 unscheduled:0")
    );
    assert!(response.capture.calendar_event_id.is_some());

    // The calendar carries an owned event with the marker properties.
    let events = gateway.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_owned());
    assert_eq!(events[0].capture_id(), Some("cap-window"));
    assert!(events[0].summary.as_deref().unwrap_or("").starts_with("[DG] "));

    // Chunks persisted wholesale.
    let chunks = pool
        .with_connection(|conn| ChunkRepository::new(conn).list_for_capture("cap-window"))
        .expect("chunks");
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].start, utc(2025, 1, 1, 10, 0));
}

#[tokio::test]
async fn tight_deadline_rejects_then_allows_late_placement() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 1, 1, 9, 0);

    let mut capture = pending_capture("cap-deadline", now);
    capture.constraint_type = ConstraintKind::DeadlineTime;
    capture.constraint_time = Some(utc(2025, 1, 1, 9, 30));
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&capture))
        .expect("insert capture");

    let service = test_service(pool.clone(), gateway.clone(), None, now);
    let error = service
        .handle_request(USER_ID, ScheduleCaptureRequest::schedule("cap-deadline"))
        .await
        .expect_err("sixty minutes cannot fit before 09:30");

    assert_eq!(error.status(), 409);
    let details = error.details().expect("structured payload").clone();
    assert_eq!(details["reason"], "slot_exceeds_deadline");
    assert_eq!(details["needed_minutes"], 60);
    assert!(details["suggestions"].as_array().is_some());

    // Same request with the late override commits past the deadline.
    let mut request = ScheduleCaptureRequest::schedule("cap-deadline");
    request.allow_late_placement = true;
    let response = service
        .handle_request(USER_ID, request)
        .await
        .expect("late placement");

    assert_eq!(response.capture.status, CaptureStatus::Scheduled);
    assert!(response.capture.planned_start.expect("start") >= utc(2025, 1, 1, 9, 30));
    assert!(response.chunks.iter().all(|chunk| chunk.late));
    assert_eq!(response.capture.freeze_until, None);
}

#[tokio::test]
async fn elapsed_deadline_is_rejected_at_the_boundary() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 1, 1, 9, 0);

    // Deadline exactly equal to now counts as elapsed.
    let mut capture = pending_capture("cap-elapsed", now);
    capture.constraint_type = ConstraintKind::DeadlineTime;
    capture.constraint_time = Some(now);
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&capture))
        .expect("insert capture");

    let service = test_service(pool, gateway, None, now);
    let error = service
        .handle_request(USER_ID, ScheduleCaptureRequest::schedule("cap-elapsed"))
        .await
        .expect_err("elapsed deadline");
    assert_eq!(error.status(), 409);
    let details = error.details().expect("payload");
    assert_eq!(details["reason"], "slot_exceeds_deadline");
}

#[tokio::test]
async fn preferred_conflict_returns_a_decision_without_mutations() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 1, 1, 9, 0);

    gateway.seed_external(utc(2025, 1, 1, 10, 0), utc(2025, 1, 1, 11, 0));
    let capture = pending_capture("cap-preferred", now);
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&capture))
        .expect("insert capture");

    let service = test_service(pool.clone(), gateway.clone(), None, now);
    let mut request = ScheduleCaptureRequest::schedule("cap-preferred");
    request.preferred_start = Some(utc(2025, 1, 1, 10, 0));
    request.preferred_end = Some(utc(2025, 1, 1, 11, 0));

    let response = service.handle_request(USER_ID, request).await.expect("decision");
    let decision = response.decision.expect("preferred_conflict decision");
    assert_eq!(decision.decision_type, "preferred_conflict");
    assert_eq!(decision.conflicts.len(), 1);
    assert!(!decision.conflicts[0].owned);
    let suggestion = decision.suggestion.expect("suggestion");
    assert!(suggestion.start >= now);

    // Nothing committed, nothing audited.
    assert!(response.plan_summary.is_none());
    let stored = pool
        .with_connection(|conn| CaptureRepository::new(conn).find_by_id("cap-preferred"))
        .expect("load")
        .expect("capture");
    assert_eq!(stored.status, CaptureStatus::Pending);
    assert_eq!(gateway.events().len(), 1);
}

#[tokio::test]
async fn free_preferred_slot_commits_directly() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 1, 1, 9, 0);

    let capture = pending_capture("cap-direct", now);
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&capture))
        .expect("insert capture");

    let service = test_service(pool, gateway, None, now);
    let mut request = ScheduleCaptureRequest::schedule("cap-direct");
    request.preferred_start = Some(utc(2025, 1, 1, 14, 0));
    request.preferred_end = Some(utc(2025, 1, 1, 15, 0));

    let response = service.handle_request(USER_ID, request).await.expect("commit");
    assert!(response.decision.is_none());
    assert_eq!(response.capture.planned_start, Some(utc(2025, 1, 1, 14, 0)));
}

#[tokio::test]
async fn fully_booked_horizon_returns_no_slot_with_capacity_report() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 1, 1, 9, 0);

    // External events swallow every working window of the horizon.
    for day in 0..8u32 {
        gateway.seed_external(utc(2025, 1, 1 + day, 7, 0), utc(2025, 1, 1 + day, 23, 0));
    }
    let capture = pending_capture("cap-full", now);
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&capture))
        .expect("insert capture");

    let service = test_service(pool, gateway, None, now);
    let error = service
        .handle_request(USER_ID, ScheduleCaptureRequest::schedule("cap-full"))
        .await
        .expect_err("no slot anywhere");

    assert_eq!(error.status(), 409);
    let details = error.details().expect("payload");
    assert_eq!(details["reason"], "no_slot");
    assert_eq!(details["available_free_minutes"], 0);
    assert!(details["external_minutes"].as_i64().unwrap_or(0) > 0);
    assert_eq!(details["diaguru_minutes"], 0);
}

#[tokio::test]
async fn frozen_capture_rejects_reschedule() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 1, 1, 9, 0);

    let mut capture = pending_capture("cap-frozen", now);
    capture.status = CaptureStatus::Scheduled;
    capture.planned_start = Some(utc(2025, 1, 1, 12, 0));
    capture.planned_end = Some(utc(2025, 1, 1, 13, 0));
    capture.calendar_event_id =
        Some(gateway.seed_owned("cap-frozen", utc(2025, 1, 1, 12, 0), utc(2025, 1, 1, 13, 0)));
    capture.calendar_event_etag = Some("v1".into());
    capture.freeze_until = Some(utc(2025, 1, 2, 9, 0));
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&capture))
        .expect("insert capture");

    let service = test_service(pool, gateway.clone(), None, now);
    let mut request = ScheduleCaptureRequest::schedule("cap-frozen");
    request.action = ScheduleAction::Reschedule;

    let error = service.handle_request(USER_ID, request).await.expect_err("frozen");
    assert_eq!(error.status(), 409);
    // The owned event survived untouched.
    assert_eq!(gateway.events().len(), 1);
}

#[tokio::test]
async fn unknown_capture_and_foreign_owner_are_refused() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 1, 1, 9, 0);

    let mut foreign = pending_capture("cap-foreign", now);
    foreign.user_id = "someone-else".into();
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&foreign))
        .expect("insert capture");

    let service = test_service(pool, gateway, None, now);

    let missing = service
        .handle_request(USER_ID, ScheduleCaptureRequest::schedule("cap-missing"))
        .await
        .expect_err("not found");
    assert_eq!(missing.status(), 404);

    let forbidden = service
        .handle_request(USER_ID, ScheduleCaptureRequest::schedule("cap-foreign"))
        .await
        .expect_err("foreign owner");
    assert_eq!(forbidden.status(), 403);

    let blank = service
        .handle_request(USER_ID, ScheduleCaptureRequest::schedule("  "))
        .await
        .expect_err("blank id");
    assert_eq!(blank.status(), 400);
    assert!(matches!(blank, ScheduleError::Validation { .. }));
}

#[tokio::test]
async fn complete_removes_the_event_and_finalizes_the_capture() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 1, 1, 9, 0);

    let mut capture = pending_capture("cap-done", now);
    capture.status = CaptureStatus::Scheduled;
    capture.planned_start = Some(utc(2025, 1, 1, 12, 0));
    capture.planned_end = Some(utc(2025, 1, 1, 13, 0));
    let event_id = gateway.seed_owned("cap-done", utc(2025, 1, 1, 12, 0), utc(2025, 1, 1, 13, 0));
    capture.calendar_event_id = Some(event_id.clone());
    capture.calendar_event_etag = Some("v1".into());
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&capture))
        .expect("insert capture");

    let service = test_service(pool.clone(), gateway.clone(), None, now);
    let mut request = ScheduleCaptureRequest::schedule("cap-done");
    request.action = ScheduleAction::Complete;

    let response = service.handle_request(USER_ID, request).await.expect("complete");
    assert_eq!(response.capture.status, CaptureStatus::Completed);
    assert!(response.capture.calendar_event_id.is_none());
    assert_eq!(
        response.plan_summary.as_deref(),
        Some("scheduled:0 moved:0 unscheduled:1")
    );
    assert!(gateway.deleted_ids().contains(&event_id));
    assert!(gateway.events().is_empty());
}
