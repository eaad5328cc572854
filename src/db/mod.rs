use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{named_params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::ScheduleResult;
use crate::services::time_utils;

pub mod migrations;

pub mod repositories;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the engine's store. Construction applies the schema and
/// migrations once; per-request opens only re-apply the connection pragmas,
/// keeping the scheduler's hot path off the migration machinery.
///
/// The calendar reconnect flag lives here rather than in a repository: it
/// gates every request before any capture is read, and it is written from
/// the auth-recovery path, not from the scheduling flow proper.
#[derive(Clone, Debug)]
pub struct DbPool {
    path: PathBuf,
}

impl DbPool {
    pub fn new<P: Into<PathBuf>>(path: P) -> ScheduleResult<Self> {
        let path = path.into();
        info!(target: "engine::db", db_path = %path.display(), "opening engine store");
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(&path)?;
        configure_connection(&mut conn)?;
        conn.execute_batch(SCHEMA_SQL)?;
        migrations::run(&conn)?;
        debug!(target: "engine::db", db_path = %path.display(), "schema and migrations applied");

        Ok(Self { path })
    }

    /// Short-lived connection for one request step. The schema is already
    /// in place from `new`.
    pub fn get_connection(&self) -> ScheduleResult<Connection> {
        let mut conn = Connection::open(&self.path)?;
        configure_connection(&mut conn)?;
        Ok(conn)
    }

    pub fn with_connection<F, T>(&self, callback: F) -> ScheduleResult<T>
    where
        F: FnOnce(&Connection) -> ScheduleResult<T>,
    {
        let conn = self.get_connection()?;
        callback(&conn)
    }

    /// Whether the user's calendar link is known to be broken. Checked at
    /// the top of every request, before the capture is even loaded.
    pub fn calendar_needs_reconnect(&self, user_id: &str) -> ScheduleResult<bool> {
        let conn = self.get_connection()?;
        let flag = conn
            .query_row(
                "SELECT needs_reconnect FROM calendar_accounts WHERE user_id = :user_id",
                named_params! {":user_id": user_id},
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(false))
    }

    /// Raised when a token refresh fails; cleared out-of-band once the user
    /// relinks the calendar.
    pub fn set_calendar_reconnect(
        &self,
        user_id: &str,
        needs_reconnect: bool,
        now: DateTime<Utc>,
    ) -> ScheduleResult<()> {
        warn!(
            target: "engine::db",
            user = %user_id,
            needs_reconnect,
            "updating calendar reconnect flag"
        );
        let conn = self.get_connection()?;
        conn.execute(
            r#"
            INSERT INTO calendar_accounts (user_id, needs_reconnect, updated_at)
            VALUES (:user_id, :needs_reconnect, :updated_at)
            ON CONFLICT(user_id) DO UPDATE SET
                needs_reconnect = excluded.needs_reconnect,
                updated_at = excluded.updated_at
            "#,
            named_params! {
                ":user_id": user_id,
                ":needs_reconnect": needs_reconnect,
                ":updated_at": time_utils::format_datetime(now),
            },
        )?;
        Ok(())
    }
}

fn configure_connection(conn: &mut Connection) -> ScheduleResult<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", &1)?;
    conn.pragma_update(None, "journal_mode", &"WAL")?;
    Ok(())
}
