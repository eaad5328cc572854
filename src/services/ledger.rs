use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::models::capture::CaptureRecord;
use crate::models::plan::{PlacementSnapshot, PlanAction, PlanActionKind, PlanRun};

/// Per-request audit accumulator. The `PlanRun` row materializes lazily on
/// the first mutation so read-only requests leave no audit residue; actions
/// keep insertion order.
#[derive(Debug)]
pub struct PlanLedger {
    user_id: String,
    run: Option<PlanRun>,
    actions: Vec<PlanAction>,
}

impl PlanLedger {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            run: None,
            actions: Vec::new(),
        }
    }

    /// Run id, creating the run on first use.
    pub fn run_id(&mut self, now: DateTime<Utc>) -> String {
        if self.run.is_none() {
            let run = PlanRun {
                id: Uuid::new_v4().to_string(),
                user_id: self.user_id.clone(),
                summary: None,
                created_at: now,
            };
            debug!(target: "engine::ledger", run_id = %run.id, "opened plan run");
            self.run = Some(run);
        }
        self.run.as_ref().map(|run| run.id.clone()).expect("run exists")
    }

    pub fn record(
        &mut self,
        kind: PlanActionKind,
        capture: &CaptureRecord,
        prev: PlacementSnapshot,
        now: DateTime<Utc>,
    ) -> String {
        let _ = self.run_id(now);
        let action = PlanAction {
            action_id: Uuid::new_v4().to_string(),
            capture_id: capture.id.clone(),
            capture_content: capture.content.clone(),
            kind,
            prev,
            next: PlacementSnapshot::of(capture),
        };
        let action_id = action.action_id.clone();
        self.actions.push(action);
        action_id
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut scheduled = 0;
        let mut moved = 0;
        let mut unscheduled = 0;
        for action in &self.actions {
            match action.kind {
                PlanActionKind::Scheduled => scheduled += 1,
                PlanActionKind::Rescheduled => moved += 1,
                PlanActionKind::Unscheduled => unscheduled += 1,
            }
        }
        format!("scheduled:{scheduled} moved:{moved} unscheduled:{unscheduled}")
    }

    /// Close the ledger: the run with its summary plus the ordered actions,
    /// or None when nothing mutated.
    pub fn finalize(mut self) -> Option<(PlanRun, Vec<PlanAction>)> {
        let summary = self.summary();
        let mut run = self.run.take()?;
        run.summary = Some(summary);
        Some((run, self.actions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::capture::{
        CaptureStatus, ConstraintKind, DurationFlexibility, StartFlexibility,
    };
    use chrono::NaiveDate;

    fn utc(h: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(2025, 2, 3)
            .expect("date")
            .and_hms_opt(h, 0, 0)
            .expect("time")
            .and_utc()
    }

    fn capture(id: &str) -> CaptureRecord {
        CaptureRecord {
            id: id.into(),
            user_id: "user-1".into(),
            content: "task".into(),
            estimated_minutes: 30,
            importance: 1,
            urgency: None,
            impact: None,
            reschedule_penalty: None,
            status: CaptureStatus::Scheduled,
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
            planned_start: Some(utc(9)),
            planned_end: Some(utc(10)),
            scheduled_for: Some(utc(9)),
            calendar_event_id: Some("evt-1".into()),
            calendar_event_etag: None,
            freeze_until: None,
            plan_id: None,
            manual_touch_at: None,
            scheduling_notes: None,
            created_at: utc(8),
            updated_at: utc(8),
        }
    }

    #[test]
    fn empty_ledger_finalizes_to_nothing() {
        let ledger = PlanLedger::new("user-1");
        assert!(ledger.is_empty());
        assert!(ledger.finalize().is_none());
    }

    #[test]
    fn summary_counts_each_kind_in_order() {
        let mut ledger = PlanLedger::new("user-1");
        let cap = capture("cap-1");
        let snapshot = PlacementSnapshot::of(&cap);
        ledger.record(PlanActionKind::Unscheduled, &cap, snapshot.clone(), utc(9));
        ledger.record(PlanActionKind::Scheduled, &cap, snapshot.clone(), utc(9));
        ledger.record(PlanActionKind::Rescheduled, &cap, snapshot, utc(9));

        let (run, actions) = ledger.finalize().expect("run");
        assert_eq!(run.summary.as_deref(), Some("scheduled:1 moved:1 unscheduled:1"));
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].kind, PlanActionKind::Unscheduled);
        assert_eq!(actions[1].kind, PlanActionKind::Scheduled);
    }

    #[test]
    fn run_id_is_stable_once_created() {
        let mut ledger = PlanLedger::new("user-1");
        let first = ledger.run_id(utc(9));
        let second = ledger.run_id(utc(10));
        assert_eq!(first, second);
    }
}
