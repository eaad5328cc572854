use std::sync::Arc;

use chrono::{DateTime, Duration, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::repositories::capture_repository::CaptureRepository;
use crate::db::repositories::chunk_repository::ChunkRepository;
use crate::db::repositories::plan_repository::PlanRepository;
use crate::db::DbPool;
use crate::error::{ScheduleError, ScheduleResult};
use crate::models::calendar::{CalendarEvent, EventDraft};
use crate::models::capture::{CaptureRecord, CaptureStatus, StartFlexibility, TimeOfDay};
use crate::models::config::SchedulerConfig;
use crate::models::outcome::{
    ConflictDecision, ConflictSummary, OverlapReport, ScheduleAction, ScheduleCaptureRequest,
    ScheduleResponse,
};
use crate::models::plan::{
    ChunkRecord, PlacementSnapshot, PlanActionKind, SchedulingPlan, Slot,
};
use crate::services::advisor::{sanitize_advisor_slot, AdvisorContext, ConflictAdvisor};
use crate::services::busy::{
    compute_busy_intervals, is_slot_free, register_interval, BusyInterval,
};
use crate::services::calendar_gateway::CalendarGateway;
use crate::services::chunking::{
    generate_chunk_durations, place_chunks_within_range, round_up_to_increment,
};
use crate::services::clock::Clock;
use crate::services::ledger::PlanLedger;
use crate::services::occupancy::{build_occupancy_grid, OccupancyGrid};
use crate::services::overlap_policy::{evaluate_overlap, prime_participant_id, OverlapMeter};
use crate::services::plan_resolver::{compute_scheduling_plan, resolve_deadline};
use crate::services::preemption::{
    evaluate_preemption_net_gain, is_movable, select_minimal_preemption_set, Displacement,
};
use crate::services::priority::priority_score;
use crate::services::routine::normalize_routine_capture;
use crate::services::slot_search::{
    find_late_placement_slot, find_next_available_slot, find_slot_before_deadline,
    find_slot_within_window, SlotSearchOptions,
};
use crate::services::time_utils;

/// Request-level orchestrator: turns one capture plus user overrides into a
/// committed placement (mutating calendar first, store second) or a
/// structured conflict decision. Engine state is request-local and
/// discarded on return.
pub struct SchedulerService {
    db: DbPool,
    calendar: Arc<dyn CalendarGateway>,
    advisor: Option<Arc<dyn ConflictAdvisor>>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

struct RequestContext {
    user_id: String,
    now: DateTime<Utc>,
    tz: Tz,
    offset_minutes: i32,
    allow_overlap: bool,
    allow_rebalance: bool,
    allow_late: bool,
}

struct EngineState {
    events: Vec<CalendarEvent>,
    busy: Vec<BusyInterval>,
    grid: OccupancyGrid,
    meter: OverlapMeter,
}

struct Commit {
    chunks: Vec<ChunkRecord>,
    reason: &'static str,
    message: String,
    overlap: Option<OverlapReport>,
}

enum PreferredOutcome {
    Committed(Commit),
    Decision(ConflictDecision),
    FallThrough,
}

impl SchedulerService {
    pub fn new(
        db: DbPool,
        calendar: Arc<dyn CalendarGateway>,
        advisor: Option<Arc<dyn ConflictAdvisor>>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            db,
            calendar,
            advisor,
            clock,
            config,
        }
    }

    pub async fn handle_request(
        &self,
        user_id: &str,
        request: ScheduleCaptureRequest,
    ) -> ScheduleResult<ScheduleResponse> {
        if request.capture_id.trim().is_empty() {
            return Err(ScheduleError::validation("captureId is required"));
        }

        let now = self.clock.now();
        if self.db.calendar_needs_reconnect(user_id)? {
            return Err(ScheduleError::validation(
                "calendar account requires reconnection",
            ));
        }
        let mut capture = {
            let conn = self.db.get_connection()?;
            CaptureRepository::new(&conn)
                .find_by_id(&request.capture_id)?
                .ok_or(ScheduleError::NotFound)?
        };

        if capture.user_id != user_id {
            return Err(ScheduleError::forbidden("capture belongs to another user"));
        }

        let tz = match request.timezone.as_deref() {
            Some(name) => time_utils::parse_timezone(name)?,
            None => chrono_tz::UTC,
        };
        let offset_minutes = request
            .timezone_offset_minutes
            .unwrap_or_else(|| tz.offset_from_utc_datetime(&now.naive_utc()).fix().local_minus_utc() / 60);

        let ctx = RequestContext {
            user_id: user_id.to_string(),
            now,
            tz,
            offset_minutes,
            allow_overlap: request.allow_overlap,
            allow_rebalance: request.allow_rebalance,
            allow_late: request.allow_late_placement,
        };

        info!(
            target: "engine::scheduler",
            capture = %capture.id,
            action = ?request.action,
            tz = %tz,
            "handling schedule-capture request"
        );

        let mut ledger = PlanLedger::new(user_id);
        let result = match request.action {
            ScheduleAction::Complete => {
                self.complete_capture(&mut capture, &ctx, &mut ledger).await
            }
            ScheduleAction::Reschedule => {
                if capture.is_frozen(ctx.now) {
                    return Err(ScheduleError::conflict_with_details(
                        "capture is frozen",
                        json!({"capture_id": capture.id, "freeze_until": capture.freeze_until}),
                    ));
                }
                self.unschedule_existing(&mut capture, &ctx, &mut ledger)
                    .await?;
                self.schedule_core(&mut capture, &request, &ctx, &mut ledger)
                    .await
            }
            ScheduleAction::Schedule => {
                if capture.status == CaptureStatus::Scheduled {
                    if capture.is_frozen(ctx.now) {
                        return Err(ScheduleError::conflict_with_details(
                            "capture is frozen",
                            json!({"capture_id": capture.id, "freeze_until": capture.freeze_until}),
                        ));
                    }
                    self.unschedule_existing(&mut capture, &ctx, &mut ledger)
                        .await?;
                }
                self.schedule_core(&mut capture, &request, &ctx, &mut ledger)
                    .await
            }
        };

        let summary = (!ledger.is_empty()).then(|| ledger.summary());
        if let Some((run, actions)) = ledger.finalize() {
            let conn = self.db.get_connection()?;
            PlanRepository::new(&conn).persist_run(&run, &actions)?;
        }

        result.map(|mut response| {
            response.plan_summary = summary;
            response
        })
    }

    // Steps 1-10 of the decision precedence.
    async fn schedule_core(
        &self,
        capture: &mut CaptureRecord,
        request: &ScheduleCaptureRequest,
        ctx: &RequestContext,
        ledger: &mut PlanLedger,
    ) -> ScheduleResult<ScheduleResponse> {
        // 1. Routine normalization, persisted before anything else runs.
        if normalize_routine_capture(capture, ctx.tz, ctx.now)? {
            capture.updated_at = ctx.now;
            let conn = self.db.get_connection()?;
            CaptureRepository::new(&conn).update(capture)?;
        }

        // 2. Live calendar state for the search horizon.
        let mut state = self.load_engine_state(ctx).await?;

        // 3. Plan, deadline, scheduling window.
        let plan = compute_scheduling_plan(capture, ctx.now, ctx.tz, &self.config)?;
        let deadline = resolve_deadline(capture, ctx.tz, &self.config)?;
        let (window_start, window_end) = self.scheduling_window(&plan, deadline, &state, ctx);
        let enforce_working = capture.routine_kind().is_none();
        debug!(
            target: "engine::scheduler",
            capture = %capture.id,
            plan = plan.mode_label(),
            deadline = ?deadline,
            window_start = %window_start,
            window_end = %window_end,
            "resolved scheduling plan"
        );

        // 4. Deadline already elapsed.
        if let Some(deadline) = deadline {
            if deadline <= ctx.now {
                let late_slot = self.late_slot(capture, deadline, &state, ctx, enforce_working);
                if ctx.allow_late {
                    if let Some(slot) = late_slot {
                        let commit = self
                            .commit_simple(capture, slot, "late_placement", true, ctx, ledger, &mut state)
                            .await?;
                        return Ok(self.commit_response(capture, commit));
                    }
                }
                return Err(ScheduleError::no_slot(
                    "slot_exceeds_deadline",
                    self.capacity_payload(
                        capture,
                        Some(deadline),
                        window_start,
                        window_end,
                        &state,
                        late_slot,
                        ctx,
                    ),
                ));
            }
        }

        // 5. Preferred slot, explicit or plan-derived.
        let explicit_preferred = request.preferred_slot();
        let plan_preferred = plan.preferred_slot();
        if let Some(preferred) = explicit_preferred.or(plan_preferred) {
            let from_plan = explicit_preferred.is_none();
            match self
                .preferred_slot_path(capture, preferred, &plan, deadline, from_plan, ctx, ledger, &mut state)
                .await?
            {
                PreferredOutcome::Committed(commit) => {
                    return Ok(self.commit_response(capture, commit))
                }
                PreferredOutcome::Decision(decision) => {
                    return Ok(self.decision_response(capture, decision))
                }
                PreferredOutcome::FallThrough => {}
            }
        }

        // 6. Plan candidate search.
        if let Some(slot) =
            self.schedule_with_plan(capture, &plan, deadline, &state, ctx, enforce_working)
        {
            let commit = self
                .commit_simple(capture, slot, "plan_candidate", false, ctx, ledger, &mut state)
                .await?;
            return Ok(self.commit_response(capture, commit));
        }

        // 7. Deadline direct placement via chunking.
        if let Some(deadline) = deadline {
            let durations = generate_chunk_durations(
                capture.duration_minutes(),
                capture.min_chunk(&self.config),
                capture.max_splits,
                capture.allows_split(),
                &self.config,
            );
            let range = Slot::new(window_start, deadline.min(window_end));
            if let Some((placements, _)) = place_chunks_within_range(
                &durations,
                &state.busy,
                range,
                ctx.now,
                enforce_working,
                ctx.offset_minutes,
                &self.config,
            ) {
                let commit = self
                    .commit_chunked(capture, placements, "deadline_chunked", false, ctx, ledger, &mut state)
                    .await?;
                return Ok(self.commit_response(capture, commit));
            }
        }

        // 8. Grid-driven preemption.
        if ctx.allow_rebalance {
            if let Some(commit) = self
                .grid_preemption(capture, &plan, window_start, window_end, ctx, ledger, &mut state)
                .await?
            {
                return Ok(self.commit_response(capture, commit));
            }
        }

        // 9. Soft-deadline late fallback under capacity pressure.
        if let Some(deadline) = deadline {
            if capture.start_flexibility != StartFlexibility::Hard {
                let stats = state.grid.window_stats(window_start, deadline.min(window_end));
                let pressure_floor = capture
                    .min_chunk(&self.config)
                    .max(capture.duration_minutes() / 4);
                if stats.free_minutes < pressure_floor {
                    if let Some(slot) = self.late_slot(capture, deadline, &state, ctx, enforce_working)
                    {
                        let commit = self
                            .commit_simple(capture, slot, "late_placement", true, ctx, ledger, &mut state)
                            .await?;
                        return Ok(self.commit_response(capture, commit));
                    }
                }
            }
        }

        // 10. Late-or-fail.
        if let Some(deadline) = deadline {
            let late_slot = self.late_slot(capture, deadline, &state, ctx, enforce_working);
            if ctx.allow_late {
                if let Some(slot) = late_slot {
                    let commit = self
                        .commit_simple(capture, slot, "late_placement", true, ctx, ledger, &mut state)
                        .await?;
                    return Ok(self.commit_response(capture, commit));
                }
            }
            return Err(ScheduleError::no_slot(
                "slot_exceeds_deadline",
                self.capacity_payload(
                    capture,
                    Some(deadline),
                    window_start,
                    window_end,
                    &state,
                    late_slot,
                    ctx,
                ),
            ));
        }

        Err(ScheduleError::no_slot(
            "no_slot",
            self.capacity_payload(capture, None, window_start, window_end, &state, None, ctx),
        ))
    }

    async fn load_engine_state(&self, ctx: &RequestContext) -> ScheduleResult<EngineState> {
        let horizon_end = ctx.now + Duration::days(self.config.search_days);
        let events = self.calendar_list(ctx, ctx.now, horizon_end).await?;
        let busy = compute_busy_intervals(
            &events,
            self.config.buffer_minutes,
            ctx.now,
            ctx.offset_minutes,
        );
        let grid = build_occupancy_grid(&events, ctx.now, ctx.offset_minutes, &self.config);
        let meter = OverlapMeter::from_events(&events, ctx.offset_minutes);
        Ok(EngineState {
            events,
            busy,
            grid,
            meter,
        })
    }

    fn scheduling_window(
        &self,
        plan: &SchedulingPlan,
        deadline: Option<DateTime<Utc>>,
        state: &EngineState,
        ctx: &RequestContext,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let grid_end = state
            .grid
            .end()
            .unwrap_or(ctx.now + Duration::days(self.config.search_days));
        match plan {
            SchedulingPlan::Window { start, end } => ((*start).max(ctx.now), *end),
            SchedulingPlan::Deadline { deadline } => (ctx.now, *deadline),
            _ => (ctx.now, deadline.unwrap_or(grid_end)),
        }
    }

    fn search_options(&self, ctx: &RequestContext, enforce_working: bool) -> SlotSearchOptions {
        SlotSearchOptions {
            start_from: None,
            reference_now: ctx.now,
            enforce_working_window: enforce_working,
            preferred_time_of_day: None,
            offset_minutes: ctx.offset_minutes,
        }
    }

    fn schedule_with_plan(
        &self,
        capture: &CaptureRecord,
        plan: &SchedulingPlan,
        deadline: Option<DateTime<Utc>>,
        state: &EngineState,
        ctx: &RequestContext,
        enforce_working: bool,
    ) -> Option<Slot> {
        let duration = round_up_to_increment(
            capture.duration_minutes(),
            self.config.slot_increment_minutes,
        );
        let mut options = self.search_options(ctx, enforce_working);

        match plan {
            SchedulingPlan::Deadline { deadline } => {
                find_slot_before_deadline(&state.busy, duration, *deadline, &options, &self.config)
            }
            SchedulingPlan::Window { start, end } => find_slot_within_window(
                &state.busy,
                duration,
                *start,
                *end,
                &options,
                &self.config,
            ),
            SchedulingPlan::Start { preferred } => {
                // Start tolerance: walk forward from the preferred start.
                options.start_from = Some(preferred.start);
                let slot =
                    find_next_available_slot(&state.busy, duration, &options, &self.config)?;
                match deadline {
                    Some(deadline) if slot.end > deadline => None,
                    _ => Some(slot),
                }
            }
            SchedulingPlan::Flexible => {
                options.preferred_time_of_day = capture.time_pref_time_of_day;
                if options.preferred_time_of_day == Some(TimeOfDay::Night) {
                    options.enforce_working_window = false;
                }
                find_next_available_slot(&state.busy, duration, &options, &self.config).or_else(
                    || {
                        // Preferred bands exhausted: flexible fallback.
                        let fallback = self.search_options(ctx, enforce_working);
                        find_next_available_slot(&state.busy, duration, &fallback, &self.config)
                    },
                )
            }
        }
    }

    fn late_slot(
        &self,
        capture: &CaptureRecord,
        deadline: DateTime<Utc>,
        state: &EngineState,
        ctx: &RequestContext,
        enforce_working: bool,
    ) -> Option<Slot> {
        let duration = round_up_to_increment(
            capture.duration_minutes(),
            self.config.slot_increment_minutes,
        );
        let options = self.search_options(ctx, enforce_working);
        find_late_placement_slot(
            &state.busy,
            duration,
            deadline.max(ctx.now),
            &options,
            &self.config,
        )
    }

    #[allow(clippy::too_many_arguments)]
    async fn preferred_slot_path(
        &self,
        capture: &mut CaptureRecord,
        preferred: Slot,
        plan: &SchedulingPlan,
        deadline: Option<DateTime<Utc>>,
        from_plan: bool,
        ctx: &RequestContext,
        ledger: &mut PlanLedger,
        state: &mut EngineState,
    ) -> ScheduleResult<PreferredOutcome> {
        let enforce_working = capture.routine_kind().is_none();
        let within_working = !enforce_working
            || (!time_utils::is_before_working_start(
                preferred.start,
                ctx.offset_minutes,
                &self.config,
            ) && !time_utils::is_after_working_end(
                preferred.end,
                ctx.offset_minutes,
                &self.config,
            ));
        let within_plan_window = match plan {
            SchedulingPlan::Window { start, end } => {
                preferred.start >= *start && preferred.end <= *end
            }
            SchedulingPlan::Deadline { deadline } => preferred.end <= *deadline,
            _ => deadline.map(|deadline| preferred.end <= deadline).unwrap_or(true),
        } && preferred.start >= ctx.now;

        let valid = within_working && within_plan_window;
        if valid && is_slot_free(preferred.start, preferred.end, &state.busy) {
            let commit = self
                .commit_simple(capture, preferred, "preferred_slot", false, ctx, ledger, state)
                .await?;
            return Ok(PreferredOutcome::Committed(commit));
        }

        let (owned_conflicts, external_conflicts) =
            conflicting_events(&state.events, preferred, ctx.offset_minutes);

        // Overlap: permitted only over our own events.
        if valid && ctx.allow_overlap && external_conflicts.is_empty() && !owned_conflicts.is_empty()
        {
            if let Some(commit) = self
                .try_overlap_commit(capture, preferred, &owned_conflicts, ctx, ledger, state)
                .await?
            {
                return Ok(PreferredOutcome::Committed(commit));
            }
        }

        // Preemption: displace outranked owned blockers.
        if valid
            && ctx.allow_rebalance
            && external_conflicts.is_empty()
            && !owned_conflicts.is_empty()
        {
            if let Some(commit) = self
                .try_preferred_preemption(capture, preferred, plan, &owned_conflicts, ctx, ledger, state)
                .await?
            {
                return Ok(PreferredOutcome::Committed(commit));
            }
        }

        // A soft plan-derived preference keeps searching instead of
        // surfacing a decision.
        if from_plan && capture.start_flexibility == StartFlexibility::Soft {
            return Ok(PreferredOutcome::FallThrough);
        }

        let decision = self
            .build_conflict_decision(
                capture,
                preferred,
                &owned_conflicts,
                &external_conflicts,
                within_working,
                within_plan_window,
                ctx,
                state,
            )
            .await;
        Ok(PreferredOutcome::Decision(decision))
    }

    async fn try_overlap_commit(
        &self,
        capture: &mut CaptureRecord,
        preferred: Slot,
        owned_conflicts: &[CalendarEvent],
        ctx: &RequestContext,
        ledger: &mut PlanLedger,
        state: &mut EngineState,
    ) -> ScheduleResult<Option<Commit>> {
        let co_scheduled = self.load_conflict_captures(owned_conflicts)?;
        if co_scheduled.is_empty() {
            return Ok(None);
        }

        let evaluation = evaluate_overlap(
            capture,
            &co_scheduled,
            preferred,
            &state.meter,
            ctx.now,
            &self.config,
        );
        if !evaluation.allowed {
            debug!(
                target: "engine::overlap",
                capture = %capture.id,
                rejection = ?evaluation.rejection,
                "overlap admission rejected"
            );
            return Ok(None);
        }

        let prime_id = {
            let mut participants: Vec<&CaptureRecord> = co_scheduled.iter().collect();
            participants.push(&*capture);
            prime_participant_id(&participants, ctx.now, &self.config).unwrap_or_default()
        };

        let chunks = vec![ChunkRecord {
            start: preferred.start,
            end: preferred.end,
            prime: prime_id == capture.id,
            late: false,
            overlapped: true,
        }];
        let commit = self
            .commit_placement(capture, preferred, chunks, "overlap", ctx, ledger, state)
            .await?;

        {
            let conn = self.db.get_connection()?;
            let chunk_repo = ChunkRepository::new(&conn);
            for co in &co_scheduled {
                chunk_repo.mark_overlapped(&co.id, co.id == prime_id)?;
            }
        }
        state
            .meter
            .charge(&evaluation.day_key, evaluation.slot_minutes);

        Ok(Some(Commit {
            chunks: commit.chunks,
            reason: "overlap",
            message: commit.message,
            overlap: Some(OverlapReport {
                with_capture_ids: co_scheduled.iter().map(|co| co.id.clone()).collect(),
                slot_minutes: evaluation.slot_minutes,
                daily_used_minutes: state.meter.used(&evaluation.day_key),
                daily_budget_minutes: self.config.overlap.daily_budget_minutes,
                prime_capture_id: prime_id,
            }),
        }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_preferred_preemption(
        &self,
        capture: &mut CaptureRecord,
        preferred: Slot,
        plan: &SchedulingPlan,
        owned_conflicts: &[CalendarEvent],
        ctx: &RequestContext,
        ledger: &mut PlanLedger,
        state: &mut EngineState,
    ) -> ScheduleResult<Option<Commit>> {
        let blockers = self.load_conflict_captures(owned_conflicts)?;
        if blockers.is_empty() {
            return Ok(None);
        }

        let bypass_stability = plan.is_deadline_mode();
        let target_priority = priority_score(capture, ctx.now, &self.config);
        for blocker in &blockers {
            if !is_movable(blocker, ctx.now, bypass_stability, &self.config) {
                debug!(
                    target: "engine::preemption",
                    blocker = %blocker.id,
                    "blocker is frozen or inside the stability window"
                );
                return Ok(None);
            }
            if priority_score(blocker, ctx.now, &self.config) >= target_priority {
                debug!(
                    target: "engine::preemption",
                    blocker = %blocker.id,
                    "blocker is not outranked"
                );
                return Ok(None);
            }
        }

        let candidate_ids: Vec<String> = owned_conflicts
            .iter()
            .map(|event| event.id.clone())
            .collect();
        let Some(selected) = select_minimal_preemption_set(
            preferred,
            &state.events,
            &candidate_ids,
            true,
            ctx.now,
            ctx.offset_minutes,
            &self.config,
        ) else {
            return Ok(None);
        };

        let displacements = displacements_for(&selected.event_ids, owned_conflicts, &blockers, preferred, ctx.offset_minutes);
        let gain = evaluate_preemption_net_gain(
            capture,
            &displacements,
            preferred.minutes(),
            ctx.now,
            &self.config,
        );
        if !gain.allowed {
            return Ok(None);
        }

        let displaced = self
            .reclaim_conflicts(&selected.event_ids, ctx, ledger, state)
            .await?;
        let commit = self
            .commit_placement(
                capture,
                preferred,
                vec![ChunkRecord {
                    start: preferred.start,
                    end: preferred.end,
                    prime: true,
                    late: false,
                    overlapped: false,
                }],
                "preemption",
                ctx,
                ledger,
                state,
            )
            .await?;

        self.reschedule_displaced(displaced, ctx, ledger, state).await;
        Ok(Some(commit))
    }

    #[allow(clippy::too_many_arguments)]
    async fn grid_preemption(
        &self,
        capture: &mut CaptureRecord,
        plan: &SchedulingPlan,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        ctx: &RequestContext,
        ledger: &mut PlanLedger,
        state: &mut EngineState,
    ) -> ScheduleResult<Option<Commit>> {
        let duration = round_up_to_increment(
            capture.duration_minutes(),
            self.config.slot_increment_minutes,
        );
        let candidates = state.grid.collect_window_candidates(
            duration,
            window_start,
            window_end,
            self.config.preemption.max_combinations,
        );

        let bypass_stability = plan.is_deadline_mode();
        let target_priority = priority_score(capture, ctx.now, &self.config);
        let mut best: Option<(f64, Slot, Vec<String>)> = None;

        for candidate in candidates
            .iter()
            .filter(|candidate| candidate.owned_minutes > 0)
        {
            let blocker_ids: Vec<String> = candidate.owners.keys().cloned().collect();
            let blockers = self.load_captures(&blocker_ids)?;
            if blockers.len() != blocker_ids.len() {
                continue;
            }
            let all_movable = blockers.iter().all(|blocker| {
                is_movable(blocker, ctx.now, bypass_stability, &self.config)
                    && priority_score(blocker, ctx.now, &self.config) < target_priority
            });
            if !all_movable {
                continue;
            }

            let displacements: Vec<Displacement> = blockers
                .iter()
                .map(|blocker| Displacement {
                    capture: blocker.clone(),
                    minutes: candidate.owners.get(&blocker.id).copied().unwrap_or(0),
                })
                .collect();
            let gain = evaluate_preemption_net_gain(
                capture,
                &displacements,
                duration,
                ctx.now,
                &self.config,
            );
            if !gain.allowed {
                continue;
            }
            if best
                .as_ref()
                .map(|(net, _, _)| gain.net > *net)
                .unwrap_or(true)
            {
                let event_ids: Vec<String> = state
                    .events
                    .iter()
                    .filter(|event| {
                        event
                            .capture_id()
                            .map(|capture_id| candidate.owners.contains_key(capture_id))
                            .unwrap_or(false)
                    })
                    .map(|event| event.id.clone())
                    .collect();
                best = Some((gain.net, candidate.slot, event_ids));
            }
        }

        let Some((net, slot, candidate_event_ids)) = best else {
            return Ok(None);
        };
        debug!(
            target: "engine::preemption",
            capture = %capture.id,
            net,
            slot_start = %slot.start,
            "selected grid preemption target"
        );

        let Some(selected) = select_minimal_preemption_set(
            slot,
            &state.events,
            &candidate_event_ids,
            true,
            ctx.now,
            ctx.offset_minutes,
            &self.config,
        ) else {
            return Ok(None);
        };

        let displaced = self
            .reclaim_conflicts(&selected.event_ids, ctx, ledger, state)
            .await?;
        let commit = self
            .commit_simple(capture, slot, "preemption", false, ctx, ledger, state)
            .await?;
        self.reschedule_displaced(displaced, ctx, ledger, state).await;
        Ok(Some(commit))
    }

    /// Delete the selected owned events (etag precondition, one
    /// refetch-retry on 412), mark their captures pending, and record the
    /// unscheduled actions ahead of the target's own commit.
    async fn reclaim_conflicts(
        &self,
        event_ids: &[String],
        ctx: &RequestContext,
        ledger: &mut PlanLedger,
        state: &mut EngineState,
    ) -> ScheduleResult<Vec<CaptureRecord>> {
        let mut displaced = Vec::new();

        for event_id in event_ids {
            let Some(event) = state.events.iter().find(|event| &event.id == event_id).cloned()
            else {
                continue;
            };

            self.delete_owned_event(ctx, &event).await?;

            if let Some(capture_id) = event.capture_id() {
                let conn = self.db.get_connection()?;
                let repo = CaptureRepository::new(&conn);
                if let Some(mut blocked) = repo.find_by_id(capture_id)? {
                    let prev = PlacementSnapshot::of(&blocked);
                    blocked.clear_placement();
                    blocked.reschedule_count += 1;
                    blocked.plan_id = Some(ledger.run_id(ctx.now));
                    blocked.updated_at = ctx.now;
                    ledger.record(PlanActionKind::Unscheduled, &blocked, prev, ctx.now);
                    repo.update(&blocked)?;
                    ChunkRepository::new(&conn).replace_for_capture(&blocked.id, &[])?;
                    displaced.push(blocked);
                }
            }

            state.events.retain(|remaining| remaining.id != event.id);
        }

        state.busy = compute_busy_intervals(
            &state.events,
            self.config.buffer_minutes,
            ctx.now,
            ctx.offset_minutes,
        );
        Ok(displaced)
    }

    /// Displaced captures are replanned after the target commit so the new
    /// busy set already contains the claimed slot. No cascading preemption;
    /// a capture that finds no room stays pending with its audit trail.
    async fn reschedule_displaced(
        &self,
        displaced: Vec<CaptureRecord>,
        ctx: &RequestContext,
        ledger: &mut PlanLedger,
        state: &mut EngineState,
    ) {
        for mut blocked in displaced {
            let outcome = self
                .reschedule_single(&mut blocked, ctx, ledger, state)
                .await;
            if let Err(error) = outcome {
                warn!(
                    target: "engine::scheduler",
                    capture = %blocked.id,
                    %error,
                    "displaced capture could not be rescheduled; left pending"
                );
            }
        }
    }

    async fn reschedule_single(
        &self,
        capture: &mut CaptureRecord,
        ctx: &RequestContext,
        ledger: &mut PlanLedger,
        state: &mut EngineState,
    ) -> ScheduleResult<()> {
        let plan = compute_scheduling_plan(capture, ctx.now, ctx.tz, &self.config)?;
        let deadline = resolve_deadline(capture, ctx.tz, &self.config)?;
        let enforce_working = capture.routine_kind().is_none();

        let slot = self
            .schedule_with_plan(capture, &plan, deadline, state, ctx, enforce_working)
            .or_else(|| {
                deadline.and_then(|deadline| {
                    if ctx.allow_late {
                        self.late_slot(capture, deadline, state, ctx, enforce_working)
                    } else {
                        None
                    }
                })
            });

        match slot {
            Some(slot) => {
                let late = deadline.map(|deadline| slot.start >= deadline).unwrap_or(false);
                self.commit_simple(capture, slot, "rebalanced", late, ctx, ledger, state)
                    .await?;
                Ok(())
            }
            None => Err(ScheduleError::conflict(format!(
                "no remaining slot for displaced capture {}",
                capture.id
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_conflict_decision(
        &self,
        capture: &CaptureRecord,
        preferred: Slot,
        owned_conflicts: &[CalendarEvent],
        external_conflicts: &[CalendarEvent],
        within_working: bool,
        within_plan_window: bool,
        ctx: &RequestContext,
        state: &EngineState,
    ) -> ConflictDecision {
        let duration = round_up_to_increment(
            capture.duration_minutes(),
            self.config.slot_increment_minutes,
        );
        let options = self.search_options(ctx, capture.routine_kind().is_none());
        let suggestion =
            find_next_available_slot(&state.busy, duration, &options, &self.config);

        let conflicts: Vec<ConflictSummary> = owned_conflicts
            .iter()
            .chain(external_conflicts.iter())
            .map(|event| summarize_event(event, ctx.offset_minutes))
            .collect();

        let baseline = if !within_working || !within_plan_window {
            format!(
                "The requested slot for \"{}\" falls outside the allowed window.",
                capture.content
            )
        } else {
            format!(
                "The requested slot for \"{}\" collides with {} event(s).",
                capture.content,
                conflicts.len()
            )
        };

        let advisor = match &self.advisor {
            Some(advisor) => {
                let context = AdvisorContext {
                    capture_id: capture.id.clone(),
                    content: capture.content.clone(),
                    duration_minutes: capture.duration_minutes(),
                    priority: priority_score(capture, ctx.now, &self.config),
                    preferred,
                    conflicts: conflicts.clone(),
                    suggestion,
                    timezone: ctx.tz.to_string(),
                    busy_summary: state
                        .busy
                        .iter()
                        .take(12)
                        .map(|interval| Slot::new(interval.start, interval.end))
                        .collect(),
                };
                match advisor.advise(&context).await {
                    Ok(decision) => Some(sanitize_advisor_slot(
                        decision,
                        &state.busy,
                        ctx.now,
                        ctx.offset_minutes,
                        &self.config,
                    )),
                    Err(error) => {
                        // Advisor failure is never fatal to the decision.
                        warn!(
                            target: "engine::advisor",
                            capture = %capture.id,
                            %error,
                            "conflict advisor failed; using baseline message"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        ConflictDecision {
            decision_type: ConflictDecision::PREFERRED_CONFLICT.to_string(),
            message: baseline,
            preferred,
            conflicts,
            suggestion,
            advisor,
            metadata: json!({
                "withinWorkingHours": within_working,
                "withinPlanWindow": within_plan_window,
                "ownedConflicts": owned_conflicts.len(),
                "externalConflicts": external_conflicts.len(),
            }),
        }
    }

    async fn commit_simple(
        &self,
        capture: &mut CaptureRecord,
        slot: Slot,
        reason: &'static str,
        late: bool,
        ctx: &RequestContext,
        ledger: &mut PlanLedger,
        state: &mut EngineState,
    ) -> ScheduleResult<Commit> {
        let chunks = vec![ChunkRecord {
            start: slot.start,
            end: slot.end,
            prime: true,
            late,
            overlapped: false,
        }];
        self.commit_placement(capture, slot, chunks, reason, ctx, ledger, state)
            .await
    }

    async fn commit_chunked(
        &self,
        capture: &mut CaptureRecord,
        placements: Vec<Slot>,
        reason: &'static str,
        late: bool,
        ctx: &RequestContext,
        ledger: &mut PlanLedger,
        state: &mut EngineState,
    ) -> ScheduleResult<Commit> {
        let spanning = Slot::new(
            placements.first().map(|slot| slot.start).unwrap_or(ctx.now),
            placements.last().map(|slot| slot.end).unwrap_or(ctx.now),
        );
        let chunks: Vec<ChunkRecord> = placements
            .iter()
            .enumerate()
            .map(|(index, slot)| ChunkRecord {
                start: slot.start,
                end: slot.end,
                prime: index == 0,
                late,
                overlapped: false,
            })
            .collect();
        self.commit_placement(capture, spanning, chunks, reason, ctx, ledger, state)
            .await
    }

    /// The single commit point: calendar create first, then the store
    /// update; a store failure triggers a best-effort compensating delete
    /// (the event also carries `action_id`, so a retry can reconcile an
    /// orphan).
    #[allow(clippy::too_many_arguments)]
    async fn commit_placement(
        &self,
        capture: &mut CaptureRecord,
        slot: Slot,
        chunks: Vec<ChunkRecord>,
        reason: &'static str,
        ctx: &RequestContext,
        ledger: &mut PlanLedger,
        state: &mut EngineState,
    ) -> ScheduleResult<Commit> {
        let prev = PlacementSnapshot::of(capture);
        let plan_id = ledger.run_id(ctx.now);
        let action_id = Uuid::new_v4().to_string();
        let priority_snapshot = priority_score(capture, ctx.now, &self.config);
        let late = chunks.iter().all(|chunk| chunk.late);
        let overlapped = chunks.iter().any(|chunk| chunk.overlapped);

        let draft = EventDraft::owned(
            &capture.content,
            slot.start,
            slot.end,
            &capture.id,
            &action_id,
            priority_snapshot,
            Some(plan_id.as_str()),
        );
        let event = self.calendar_create(ctx, &draft).await?;

        capture.status = CaptureStatus::Scheduled;
        capture.planned_start = Some(slot.start);
        capture.planned_end = Some(slot.end);
        capture.scheduled_for = Some(slot.start);
        capture.calendar_event_id = Some(event.id.clone());
        capture.calendar_event_etag = event.etag.clone();
        capture.plan_id = Some(plan_id.clone());
        capture.updated_at = ctx.now;
        if late {
            capture.freeze_until = None;
        }

        let mut notes = capture.notes();
        if let Some(previous) = notes.explanation.take() {
            notes.previous_note = serde_json::to_value(&previous).ok();
        }
        notes.overlap = overlapped.then_some(true).or(notes.overlap);
        let message = commit_message(reason, &slot, late);
        notes.explanation = Some(crate::models::capture::ExplanationRecord {
            reason: reason.to_string(),
            message: message.clone(),
            generated_at: ctx.now,
        });
        capture.set_notes(notes);

        let kind = if prev.calendar_event_id.is_some() || capture.reschedule_count > 0 {
            PlanActionKind::Rescheduled
        } else {
            PlanActionKind::Scheduled
        };
        ledger.record(kind, capture, prev, ctx.now);

        let store_result = (|| -> ScheduleResult<()> {
            let conn = self.db.get_connection()?;
            CaptureRepository::new(&conn).update(capture)?;
            ChunkRepository::new(&conn).replace_for_capture(&capture.id, &chunks)?;
            Ok(())
        })();

        if let Err(store_error) = store_result {
            warn!(
                target: "engine::scheduler",
                capture = %capture.id,
                event = %event.id,
                %store_error,
                "store update failed after calendar create; compensating"
            );
            if let Err(delete_error) = self
                .calendar
                .delete_event(&ctx.user_id, &event.id, event.etag.as_deref())
                .await
            {
                warn!(
                    target: "engine::scheduler",
                    event = %event.id,
                    %delete_error,
                    "compensating delete failed; orphan event carries action_id"
                );
            }
            return Err(ScheduleError::internal(format!(
                "store update failed after calendar commit: {store_error}"
            )));
        }

        register_interval(&mut state.busy, &slot, self.config.buffer_minutes);
        state.events.push(event);

        info!(
            target: "engine::scheduler",
            capture = %capture.id,
            reason,
            start = %slot.start,
            end = %slot.end,
            late,
            "capture committed"
        );

        Ok(Commit {
            chunks,
            reason,
            message,
            overlap: None,
        })
    }

    async fn unschedule_existing(
        &self,
        capture: &mut CaptureRecord,
        ctx: &RequestContext,
        ledger: &mut PlanLedger,
    ) -> ScheduleResult<()> {
        let Some(event_id) = capture.calendar_event_id.clone() else {
            return Ok(());
        };

        let event = CalendarEvent {
            id: event_id,
            summary: None,
            etag: capture.calendar_event_etag.clone(),
            start: crate::models::calendar::EventTime::DateTime(
                capture.planned_start.unwrap_or(ctx.now),
            ),
            end: crate::models::calendar::EventTime::DateTime(
                capture.planned_end.unwrap_or(ctx.now),
            ),
            private_properties: Default::default(),
        };
        self.delete_owned_event(ctx, &event).await?;

        let prev = PlacementSnapshot::of(capture);
        capture.clear_placement();
        capture.reschedule_count += 1;
        capture.plan_id = Some(ledger.run_id(ctx.now));
        capture.updated_at = ctx.now;
        ledger.record(PlanActionKind::Unscheduled, capture, prev, ctx.now);

        let conn = self.db.get_connection()?;
        CaptureRepository::new(&conn).update(capture)?;
        ChunkRepository::new(&conn).replace_for_capture(&capture.id, &[])?;
        Ok(())
    }

    async fn complete_capture(
        &self,
        capture: &mut CaptureRecord,
        ctx: &RequestContext,
        ledger: &mut PlanLedger,
    ) -> ScheduleResult<ScheduleResponse> {
        let prev = PlacementSnapshot::of(capture);

        if let Some(event_id) = capture.calendar_event_id.clone() {
            let event = CalendarEvent {
                id: event_id,
                summary: None,
                etag: capture.calendar_event_etag.clone(),
                start: crate::models::calendar::EventTime::DateTime(
                    capture.planned_start.unwrap_or(ctx.now),
                ),
                end: crate::models::calendar::EventTime::DateTime(
                    capture.planned_end.unwrap_or(ctx.now),
                ),
                private_properties: Default::default(),
            };
            if let Err(error) = self.delete_owned_event(ctx, &event).await {
                warn!(
                    target: "engine::scheduler",
                    capture = %capture.id,
                    %error,
                    "failed to delete event for completed capture"
                );
            }
        }

        capture.status = CaptureStatus::Completed;
        capture.calendar_event_id = None;
        capture.calendar_event_etag = None;
        capture.freeze_until = None;
        capture.plan_id = Some(ledger.run_id(ctx.now));
        capture.updated_at = ctx.now;
        ledger.record(PlanActionKind::Unscheduled, capture, prev, ctx.now);

        {
            let conn = self.db.get_connection()?;
            CaptureRepository::new(&conn).update(capture)?;
            ChunkRepository::new(&conn).replace_for_capture(&capture.id, &[])?;
        }

        Ok(ScheduleResponse {
            message: "capture completed".to_string(),
            capture: capture.clone(),
            plan_summary: None,
            chunks: Vec::new(),
            explanation: None,
            overlap: None,
            decision: None,
        })
    }

    fn commit_response(&self, capture: &CaptureRecord, commit: Commit) -> ScheduleResponse {
        ScheduleResponse {
            message: format!("capture {}", if commit.reason == "overlap" { "scheduled with overlap" } else { "scheduled" }),
            capture: capture.clone(),
            plan_summary: None,
            chunks: commit.chunks,
            explanation: Some(commit.message),
            overlap: commit.overlap,
            decision: None,
        }
    }

    fn decision_response(
        &self,
        capture: &CaptureRecord,
        decision: ConflictDecision,
    ) -> ScheduleResponse {
        ScheduleResponse {
            message: decision.message.clone(),
            capture: capture.clone(),
            plan_summary: None,
            chunks: Vec::new(),
            explanation: None,
            overlap: None,
            decision: Some(decision),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn capacity_payload(
        &self,
        capture: &CaptureRecord,
        deadline: Option<DateTime<Utc>>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        state: &EngineState,
        late_candidate: Option<Slot>,
        ctx: &RequestContext,
    ) -> JsonValue {
        let stats = state.grid.window_stats(window_start, window_end);
        let needed = round_up_to_increment(
            capture.duration_minutes(),
            self.config.slot_increment_minutes,
        );

        let mut suggestions = Vec::new();
        let mut options = self.search_options(ctx, capture.routine_kind().is_none());
        for _ in 0..3 {
            match find_next_available_slot(&state.busy, needed, &options, &self.config) {
                Some(slot) => {
                    suggestions.push(slot);
                    options.start_from = Some(slot.end);
                }
                None => break,
            }
        }

        json!({
            "capture_id": capture.id,
            "deadline": deadline.map(time_utils::format_datetime),
            "window_start": time_utils::format_datetime(window_start),
            "window_end": time_utils::format_datetime(window_end),
            "needed_minutes": needed,
            "available_free_minutes": stats.free_minutes,
            "diaguru_minutes": stats.owned_minutes,
            "external_minutes": stats.external_minutes,
            "late_candidate": late_candidate,
            "suggestions": suggestions,
        })
    }

    fn load_conflict_captures(
        &self,
        owned_conflicts: &[CalendarEvent],
    ) -> ScheduleResult<Vec<CaptureRecord>> {
        let ids: Vec<String> = owned_conflicts
            .iter()
            .filter_map(|event| event.capture_id().map(str::to_string))
            .collect();
        self.load_captures(&ids)
    }

    fn load_captures(&self, ids: &[String]) -> ScheduleResult<Vec<CaptureRecord>> {
        let conn = self.db.get_connection()?;
        let repo = CaptureRepository::new(&conn);
        let mut captures = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(capture) = repo.find_by_id(id)? {
                captures.push(capture);
            }
        }
        Ok(captures)
    }

    // Calendar access with the single-token-refresh recovery policy.

    async fn calendar_list(
        &self,
        ctx: &RequestContext,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ScheduleResult<Vec<CalendarEvent>> {
        match self.calendar.list_events(&ctx.user_id, from, to).await {
            Err(error) if error.status() == 401 => {
                self.refresh_or_flag(ctx).await?;
                self.calendar.list_events(&ctx.user_id, from, to).await
            }
            other => other,
        }
    }

    async fn calendar_create(
        &self,
        ctx: &RequestContext,
        draft: &EventDraft,
    ) -> ScheduleResult<CalendarEvent> {
        match self.calendar.create_event(&ctx.user_id, draft).await {
            Err(error) if error.status() == 401 => {
                self.refresh_or_flag(ctx).await?;
                self.calendar.create_event(&ctx.user_id, draft).await
            }
            other => other,
        }
    }

    /// Delete with etag precondition; a stale tag is refetched and retried
    /// exactly once.
    async fn delete_owned_event(
        &self,
        ctx: &RequestContext,
        event: &CalendarEvent,
    ) -> ScheduleResult<()> {
        let attempt = self
            .calendar
            .delete_event(&ctx.user_id, &event.id, event.etag.as_deref())
            .await;
        match attempt {
            Err(error) if error.status() == 412 => {
                debug!(
                    target: "engine::calendar",
                    event = %event.id,
                    "stale etag on delete; refetching version tag"
                );
                let fresh = self.calendar.get_event(&ctx.user_id, &event.id).await?;
                self.calendar
                    .delete_event(&ctx.user_id, &event.id, fresh.etag.as_deref())
                    .await
            }
            Err(error) if error.status() == 401 => {
                self.refresh_or_flag(ctx).await?;
                self.calendar
                    .delete_event(&ctx.user_id, &event.id, event.etag.as_deref())
                    .await
            }
            other => other,
        }
    }

    async fn refresh_or_flag(&self, ctx: &RequestContext) -> ScheduleResult<()> {
        if let Err(refresh_error) = self.calendar.refresh_auth(&ctx.user_id).await {
            warn!(
                target: "engine::calendar",
                user = %ctx.user_id,
                %refresh_error,
                "token refresh failed; flagging account for reconnect"
            );
            self.db.set_calendar_reconnect(&ctx.user_id, true, ctx.now)?;
            return Err(ScheduleError::validation(
                "calendar account requires reconnection",
            ));
        }
        Ok(())
    }
}

fn conflicting_events(
    events: &[CalendarEvent],
    slot: Slot,
    offset_minutes: i32,
) -> (Vec<CalendarEvent>, Vec<CalendarEvent>) {
    let mut owned = Vec::new();
    let mut external = Vec::new();
    for event in events {
        let start = event.start_instant(offset_minutes);
        let end = event.end_instant(offset_minutes);
        if start < slot.end && slot.start < end {
            if event.is_owned() {
                owned.push(event.clone());
            } else {
                external.push(event.clone());
            }
        }
    }
    (owned, external)
}

fn summarize_event(event: &CalendarEvent, offset_minutes: i32) -> ConflictSummary {
    ConflictSummary {
        event_id: event.id.clone(),
        summary: event.summary.clone(),
        start: event.start_instant(offset_minutes),
        end: event.end_instant(offset_minutes),
        owned: event.is_owned(),
        capture_id: event.capture_id().map(str::to_string),
    }
}

fn displacements_for(
    selected_event_ids: &[String],
    owned_conflicts: &[CalendarEvent],
    blockers: &[CaptureRecord],
    slot: Slot,
    offset_minutes: i32,
) -> Vec<Displacement> {
    let mut displacements = Vec::new();
    for event_id in selected_event_ids {
        let Some(event) = owned_conflicts.iter().find(|event| &event.id == event_id) else {
            continue;
        };
        let Some(capture_id) = event.capture_id() else {
            continue;
        };
        let Some(blocker) = blockers.iter().find(|blocker| blocker.id == capture_id) else {
            continue;
        };
        let start = event.start_instant(offset_minutes).max(slot.start);
        let end = event.end_instant(offset_minutes).min(slot.end);
        let minutes = (end - start).num_minutes().max(0);
        displacements.push(Displacement {
            capture: blocker.clone(),
            minutes,
        });
    }
    displacements
}

fn commit_message(reason: &str, slot: &Slot, late: bool) -> String {
    let span = format!(
        "{} to {}",
        slot.start.format("%Y-%m-%d %H:%M"),
        slot.end.format("%H:%M")
    );
    match reason {
        "preferred_slot" => format!("Placed at the requested time ({span})."),
        "plan_candidate" => format!("Placed at the earliest slot matching its constraints ({span})."),
        "deadline_chunked" => format!("Split into chunks to fit before the deadline ({span})."),
        "overlap" => format!("Co-scheduled with an existing task ({span})."),
        "preemption" => format!("Made room by moving lower-priority tasks ({span})."),
        "rebalanced" => format!("Moved to the next open slot ({span})."),
        "late_placement" if late => format!("Scheduled past the deadline ({span})."),
        _ => format!("Scheduled ({span})."),
    }
}
