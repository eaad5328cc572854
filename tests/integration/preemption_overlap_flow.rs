mod support;

use diaguru_engine::db::repositories::capture_repository::CaptureRepository;
use diaguru_engine::db::repositories::chunk_repository::ChunkRepository;
use diaguru_engine::models::capture::CaptureStatus;
use diaguru_engine::models::outcome::{ScheduleAction, ScheduleCaptureRequest};
use diaguru_engine::models::plan::ChunkRecord;
use support::{pending_capture, test_pool, test_service, utc, MockCalendarGateway, USER_ID};
use tempfile::tempdir;

#[tokio::test]
async fn overlap_commit_marks_both_participants_and_picks_a_prime() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 3, 3, 9, 0);

    // The incumbent: a low-priority capture already on the calendar.
    let mut incumbent = pending_capture("cap-b", now);
    incumbent.status = CaptureStatus::Scheduled;
    incumbent.planned_start = Some(utc(2025, 3, 3, 10, 0));
    incumbent.planned_end = Some(utc(2025, 3, 3, 10, 30));
    incumbent.estimated_minutes = 30;
    let event_id =
        gateway.seed_owned("cap-b", utc(2025, 3, 3, 10, 0), utc(2025, 3, 3, 10, 30));
    incumbent.calendar_event_id = Some(event_id);
    incumbent.calendar_event_etag = Some("v1".into());
    pool.with_connection(|conn| {
        CaptureRepository::new(conn).insert(&incumbent)?;
        ChunkRepository::new(conn).replace_for_capture(
            "cap-b",
            &[ChunkRecord {
                start: utc(2025, 3, 3, 10, 0),
                end: utc(2025, 3, 3, 10, 30),
                prime: true,
                late: false,
                overlapped: false,
            }],
        )
    })
    .expect("seed incumbent");

    // The target outranks it and offers overlap.
    let mut target = pending_capture("cap-a", now);
    target.importance = 5;
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&target))
        .expect("insert target");

    let service = test_service(pool.clone(), gateway.clone(), None, now);
    let mut request = ScheduleCaptureRequest::schedule("cap-a");
    request.preferred_start = Some(utc(2025, 3, 3, 10, 0));
    request.preferred_end = Some(utc(2025, 3, 3, 10, 30));
    request.allow_overlap = true;

    let response = service.handle_request(USER_ID, request).await.expect("overlap commit");

    assert!(response.decision.is_none());
    let overlap = response.overlap.expect("overlap report");
    assert_eq!(overlap.prime_capture_id, "cap-a");
    assert_eq!(overlap.with_capture_ids, vec!["cap-b".to_string()]);
    assert_eq!(overlap.slot_minutes, 30);

    assert_eq!(response.chunks.len(), 1);
    assert!(response.chunks[0].overlapped);
    assert!(response.chunks[0].prime);

    // The incumbent keeps its slot but its chunks flip to overlapped.
    let incumbent_chunks = pool
        .with_connection(|conn| ChunkRepository::new(conn).list_for_capture("cap-b"))
        .expect("incumbent chunks");
    assert!(incumbent_chunks.iter().all(|chunk| chunk.overlapped));
    assert!(incumbent_chunks.iter().all(|chunk| !chunk.prime));

    let incumbent_after = pool
        .with_connection(|conn| CaptureRepository::new(conn).find_by_id("cap-b"))
        .expect("load")
        .expect("incumbent");
    assert_eq!(incumbent_after.planned_start, Some(utc(2025, 3, 3, 10, 0)));
    assert_eq!(incumbent_after.status, CaptureStatus::Scheduled);

    // Both events coexist on the calendar.
    assert_eq!(gateway.events().len(), 2);
}

#[tokio::test]
async fn hard_start_incumbent_blocks_overlap() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 3, 3, 9, 0);

    let mut incumbent = pending_capture("cap-b", now);
    incumbent.status = CaptureStatus::Scheduled;
    incumbent.cannot_overlap = true;
    incumbent.planned_start = Some(utc(2025, 3, 3, 10, 0));
    incumbent.planned_end = Some(utc(2025, 3, 3, 10, 30));
    incumbent.calendar_event_id =
        Some(gateway.seed_owned("cap-b", utc(2025, 3, 3, 10, 0), utc(2025, 3, 3, 10, 30)));
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&incumbent))
        .expect("seed incumbent");

    let mut target = pending_capture("cap-a", now);
    target.importance = 5;
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&target))
        .expect("insert target");

    let service = test_service(pool, gateway, None, now);
    let mut request = ScheduleCaptureRequest::schedule("cap-a");
    request.preferred_start = Some(utc(2025, 3, 3, 10, 0));
    request.preferred_end = Some(utc(2025, 3, 3, 10, 30));
    request.allow_overlap = true;

    let response = service.handle_request(USER_ID, request).await.expect("decision");
    assert!(response.overlap.is_none());
    assert!(response.decision.is_some());
}

#[tokio::test]
async fn preemption_displaces_and_reschedules_the_outranked_blocker() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 3, 3, 8, 0);

    let mut blocker = pending_capture("cap-blocker", now);
    blocker.status = CaptureStatus::Scheduled;
    blocker.planned_start = Some(utc(2025, 3, 3, 10, 0));
    blocker.planned_end = Some(utc(2025, 3, 3, 11, 0));
    blocker.calendar_event_id =
        Some(gateway.seed_owned("cap-blocker", utc(2025, 3, 3, 10, 0), utc(2025, 3, 3, 11, 0)));
    blocker.calendar_event_etag = Some("v1".into());
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&blocker))
        .expect("seed blocker");

    let mut target = pending_capture("cap-target", now);
    target.importance = 5;
    target.urgency = Some(1.0);
    target.estimated_minutes = 30;
    target.deadline_at = Some(utc(2025, 3, 3, 12, 0));
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&target))
        .expect("insert target");

    let service = test_service(pool.clone(), gateway.clone(), None, now);
    let mut request = ScheduleCaptureRequest::schedule("cap-target");
    request.preferred_start = Some(utc(2025, 3, 3, 10, 0));
    request.preferred_end = Some(utc(2025, 3, 3, 10, 30));
    request.allow_rebalance = true;

    let response = service.handle_request(USER_ID, request).await.expect("preemption");

    assert!(response.decision.is_none());
    assert_eq!(response.capture.planned_start, Some(utc(2025, 3, 3, 10, 0)));
    assert_eq!(
        response.plan_summary.as_deref(),
        Some("scheduled:1 moved:1 unscheduled:1")
    );

    // The blocker landed somewhere else, with its reschedule count bumped.
    let moved = pool
        .with_connection(|conn| CaptureRepository::new(conn).find_by_id("cap-blocker"))
        .expect("load")
        .expect("blocker");
    assert_eq!(moved.status, CaptureStatus::Scheduled);
    assert_eq!(moved.reschedule_count, 1);
    assert_ne!(moved.planned_start, Some(utc(2025, 3, 3, 10, 0)));
    assert!(moved.planned_start.expect("start") >= now);

    // Old blocker event deleted, two fresh events exist.
    assert_eq!(gateway.deleted_ids().len(), 1);
    assert_eq!(gateway.events().len(), 2);
}

#[tokio::test]
async fn stability_window_turns_preemption_into_a_decision() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 3, 3, 9, 0);

    // Blocker starts in ten minutes: inside the stability window.
    let mut blocker = pending_capture("cap-blocker", now);
    blocker.status = CaptureStatus::Scheduled;
    blocker.planned_start = Some(utc(2025, 3, 3, 9, 10));
    blocker.planned_end = Some(utc(2025, 3, 3, 10, 10));
    blocker.calendar_event_id =
        Some(gateway.seed_owned("cap-blocker", utc(2025, 3, 3, 9, 10), utc(2025, 3, 3, 10, 10)));
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&blocker))
        .expect("seed blocker");

    let mut target = pending_capture("cap-target", now);
    target.importance = 5;
    target.urgency = Some(1.0);
    target.estimated_minutes = 30;
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&target))
        .expect("insert target");

    let service = test_service(pool.clone(), gateway.clone(), None, now);
    let mut request = ScheduleCaptureRequest::schedule("cap-target");
    request.preferred_start = Some(utc(2025, 3, 3, 9, 15));
    request.preferred_end = Some(utc(2025, 3, 3, 9, 45));
    request.allow_rebalance = true;

    let response = service.handle_request(USER_ID, request).await.expect("decision");
    let decision = response.decision.expect("preferred_conflict");
    assert_eq!(decision.decision_type, "preferred_conflict");
    assert!(decision.conflicts.iter().any(|conflict| conflict.owned));

    // No mutations: blocker untouched, no audit rows, no deletes.
    assert!(response.plan_summary.is_none());
    let untouched = pool
        .with_connection(|conn| CaptureRepository::new(conn).find_by_id("cap-blocker"))
        .expect("load")
        .expect("blocker");
    assert_eq!(untouched.planned_start, Some(utc(2025, 3, 3, 9, 10)));
    assert_eq!(untouched.reschedule_count, 0);
    assert!(gateway.deleted_ids().is_empty());
}

#[tokio::test]
async fn stale_etag_on_reschedule_is_refetched_and_retried_once() {
    let dir = tempdir().expect("temp dir");
    let pool = test_pool(&dir);
    let gateway = MockCalendarGateway::new();
    let now = utc(2025, 3, 3, 9, 0);

    let mut capture = pending_capture("cap-move", now);
    capture.status = CaptureStatus::Scheduled;
    capture.planned_start = Some(utc(2025, 3, 3, 14, 0));
    capture.planned_end = Some(utc(2025, 3, 3, 15, 0));
    let old_event =
        gateway.seed_owned("cap-move", utc(2025, 3, 3, 14, 0), utc(2025, 3, 3, 15, 0));
    capture.calendar_event_id = Some(old_event.clone());
    capture.calendar_event_etag = Some("v1".into());
    pool.with_connection(|conn| CaptureRepository::new(conn).insert(&capture))
        .expect("insert capture");

    // First delete hits a stale version tag; the retry after refetch wins.
    gateway.fail_next_delete_with_stale_etag();

    let service = test_service(pool.clone(), gateway.clone(), None, now);
    let mut request = ScheduleCaptureRequest::schedule("cap-move");
    request.action = ScheduleAction::Reschedule;

    let response = service.handle_request(USER_ID, request).await.expect("reschedule");
    assert_eq!(response.capture.status, CaptureStatus::Scheduled);
    assert_eq!(response.capture.reschedule_count, 1);
    assert_ne!(response.capture.calendar_event_id.as_deref(), Some(old_event.as_str()));
    assert_eq!(
        response.plan_summary.as_deref(),
        Some("scheduled:0 moved:1 unscheduled:1")
    );
    assert!(gateway.deleted_ids().contains(&old_event));
}
