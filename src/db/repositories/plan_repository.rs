use std::convert::TryFrom;

use rusqlite::{named_params, Connection, OptionalExtension, Row};

use crate::error::ScheduleResult;
use crate::models::capture::CaptureStatus;
use crate::models::plan::{PlacementSnapshot, PlanAction, PlanActionKind, PlanRun};
use crate::services::time_utils;

#[derive(Debug, Clone)]
pub struct PlanActionRow {
    pub action_id: String,
    pub plan_id: String,
    pub position: i64,
    pub capture_id: String,
    pub capture_content: String,
    pub action_type: String,
    pub prev_status: String,
    pub prev_planned_start: Option<String>,
    pub prev_planned_end: Option<String>,
    pub prev_calendar_event_id: Option<String>,
    pub prev_calendar_event_etag: Option<String>,
    pub prev_freeze_until: Option<String>,
    pub prev_plan_id: Option<String>,
    pub next_status: String,
    pub next_planned_start: Option<String>,
    pub next_planned_end: Option<String>,
    pub next_calendar_event_id: Option<String>,
    pub next_calendar_event_etag: Option<String>,
    pub next_freeze_until: Option<String>,
    pub next_plan_id: Option<String>,
    pub created_at: String,
}

impl PlanActionRow {
    pub fn into_action(self) -> ScheduleResult<PlanAction> {
        Ok(PlanAction {
            action_id: self.action_id,
            capture_id: self.capture_id,
            capture_content: self.capture_content,
            kind: PlanActionKind::parse(&self.action_type),
            prev: PlacementSnapshot {
                status: CaptureStatus::parse(&self.prev_status),
                planned_start: time_utils::parse_optional_datetime(
                    self.prev_planned_start.as_ref(),
                )?,
                planned_end: time_utils::parse_optional_datetime(self.prev_planned_end.as_ref())?,
                calendar_event_id: self.prev_calendar_event_id,
                calendar_event_etag: self.prev_calendar_event_etag,
                freeze_until: time_utils::parse_optional_datetime(self.prev_freeze_until.as_ref())?,
                plan_id: self.prev_plan_id,
            },
            next: PlacementSnapshot {
                status: CaptureStatus::parse(&self.next_status),
                planned_start: time_utils::parse_optional_datetime(
                    self.next_planned_start.as_ref(),
                )?,
                planned_end: time_utils::parse_optional_datetime(self.next_planned_end.as_ref())?,
                calendar_event_id: self.next_calendar_event_id,
                calendar_event_etag: self.next_calendar_event_etag,
                freeze_until: time_utils::parse_optional_datetime(self.next_freeze_until.as_ref())?,
                plan_id: self.next_plan_id,
            },
        })
    }
}

impl TryFrom<&Row<'_>> for PlanActionRow {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'_>) -> Result<Self, Self::Error> {
        Ok(Self {
            action_id: row.get("action_id")?,
            plan_id: row.get("plan_id")?,
            position: row.get("position")?,
            capture_id: row.get("capture_id")?,
            capture_content: row.get("capture_content")?,
            action_type: row.get("action_type")?,
            prev_status: row.get("prev_status")?,
            prev_planned_start: row.get("prev_planned_start")?,
            prev_planned_end: row.get("prev_planned_end")?,
            prev_calendar_event_id: row.get("prev_calendar_event_id")?,
            prev_calendar_event_etag: row.get("prev_calendar_event_etag")?,
            prev_freeze_until: row.get("prev_freeze_until")?,
            prev_plan_id: row.get("prev_plan_id")?,
            next_status: row.get("next_status")?,
            next_planned_start: row.get("next_planned_start")?,
            next_planned_end: row.get("next_planned_end")?,
            next_calendar_event_id: row.get("next_calendar_event_id")?,
            next_calendar_event_etag: row.get("next_calendar_event_etag")?,
            next_freeze_until: row.get("next_freeze_until")?,
            next_plan_id: row.get("next_plan_id")?,
            created_at: row.get("created_at")?,
        })
    }
}

pub struct PlanRepository<'a> {
    conn: &'a Connection,
}

impl<'a> PlanRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn find_run(&self, run_id: &str) -> ScheduleResult<Option<PlanRun>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, user_id, summary, created_at FROM plan_runs WHERE id = :id",
                named_params! {":id": run_id},
                |row| {
                    Ok((
                        row.get::<_, String>("id")?,
                        row.get::<_, String>("user_id")?,
                        row.get::<_, Option<String>>("summary")?,
                        row.get::<_, String>("created_at")?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, user_id, summary, created_at)| {
            Ok(PlanRun {
                id,
                user_id,
                summary,
                created_at: time_utils::parse_datetime(&created_at)?,
            })
        })
        .transpose()
    }

    /// Persist a finalized run and its actions in one transaction, keeping
    /// ledger insertion order.
    pub fn persist_run(&self, run: &PlanRun, actions: &[PlanAction]) -> ScheduleResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = self.persist_run_inner(run, actions);
        if result.is_ok() {
            self.conn.execute_batch("COMMIT")?;
        } else {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
        result
    }

    fn persist_run_inner(&self, run: &PlanRun, actions: &[PlanAction]) -> ScheduleResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO plan_runs (id, user_id, summary, created_at)
            VALUES (:id, :user_id, :summary, :created_at)
            ON CONFLICT(id) DO UPDATE SET summary = excluded.summary
            "#,
            named_params! {
                ":id": run.id,
                ":user_id": run.user_id,
                ":summary": run.summary,
                ":created_at": time_utils::format_datetime(run.created_at),
            },
        )?;

        let created_at = time_utils::format_datetime(run.created_at);
        for (position, action) in actions.iter().enumerate() {
            self.conn.execute(
                r#"
                INSERT INTO plan_actions (
                    action_id, plan_id, position, capture_id, capture_content,
                    action_type,
                    prev_status, prev_planned_start, prev_planned_end,
                    prev_calendar_event_id, prev_calendar_event_etag,
                    prev_freeze_until, prev_plan_id,
                    next_status, next_planned_start, next_planned_end,
                    next_calendar_event_id, next_calendar_event_etag,
                    next_freeze_until, next_plan_id,
                    created_at
                ) VALUES (
                    :action_id, :plan_id, :position, :capture_id, :capture_content,
                    :action_type,
                    :prev_status, :prev_planned_start, :prev_planned_end,
                    :prev_calendar_event_id, :prev_calendar_event_etag,
                    :prev_freeze_until, :prev_plan_id,
                    :next_status, :next_planned_start, :next_planned_end,
                    :next_calendar_event_id, :next_calendar_event_etag,
                    :next_freeze_until, :next_plan_id,
                    :created_at
                )
                "#,
                named_params! {
                    ":action_id": action.action_id,
                    ":plan_id": run.id,
                    ":position": position as i64,
                    ":capture_id": action.capture_id,
                    ":capture_content": action.capture_content,
                    ":action_type": action.kind.as_str(),
                    ":prev_status": action.prev.status.as_str(),
                    ":prev_planned_start": action.prev.planned_start.map(time_utils::format_datetime),
                    ":prev_planned_end": action.prev.planned_end.map(time_utils::format_datetime),
                    ":prev_calendar_event_id": action.prev.calendar_event_id,
                    ":prev_calendar_event_etag": action.prev.calendar_event_etag,
                    ":prev_freeze_until": action.prev.freeze_until.map(time_utils::format_datetime),
                    ":prev_plan_id": action.prev.plan_id,
                    ":next_status": action.next.status.as_str(),
                    ":next_planned_start": action.next.planned_start.map(time_utils::format_datetime),
                    ":next_planned_end": action.next.planned_end.map(time_utils::format_datetime),
                    ":next_calendar_event_id": action.next.calendar_event_id,
                    ":next_calendar_event_etag": action.next.calendar_event_etag,
                    ":next_freeze_until": action.next.freeze_until.map(time_utils::format_datetime),
                    ":next_plan_id": action.next.plan_id,
                    ":created_at": created_at,
                },
            )?;
        }

        Ok(())
    }

    pub fn list_actions(&self, run_id: &str) -> ScheduleResult<Vec<PlanAction>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM plan_actions WHERE plan_id = :plan_id ORDER BY position",
        )?;
        let rows = stmt.query_map(named_params! {":plan_id": run_id}, |row| {
            PlanActionRow::try_from(row)
        })?;

        let mut actions = Vec::new();
        for row in rows {
            actions.push(row?.into_action()?);
        }
        Ok(actions)
    }
}
