use rusqlite::Connection;
use tracing::info;

use crate::error::ScheduleResult;

const USER_VERSION: i32 = 2;

pub fn run(conn: &Connection) -> ScheduleResult<()> {
    let mut current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current_version < 1 {
        info!(target: "engine::db", version = current_version, "running migration v1");
        migrate_to_v1(conn)?;
        current_version = 1;
        conn.execute(&format!("PRAGMA user_version = {}", current_version), [])?;
    }

    if current_version < 2 {
        info!(target: "engine::db", version = current_version, "running migration v2");
        migrate_to_v2(conn)?;
        current_version = 2;
        conn.execute(&format!("PRAGMA user_version = {}", current_version), [])?;
    }

    if current_version != USER_VERSION {
        conn.execute(&format!("PRAGMA user_version = {}", USER_VERSION), [])?;
    }

    Ok(())
}

fn migrate_to_v1(conn: &Connection) -> ScheduleResult<()> {
    ensure_column(conn, "capture_entries", "scheduling_notes", "TEXT")?;
    ensure_column(conn, "capture_entries", "manual_touch_at", "TEXT")?;
    Ok(())
}

fn migrate_to_v2(conn: &Connection) -> ScheduleResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS calendar_accounts (
            user_id TEXT PRIMARY KEY,
            needs_reconnect INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    column_type: &str,
) -> ScheduleResult<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;

    if !existing.iter().any(|name| name == column) {
        conn.execute(
            &format!("ALTER TABLE {table} ADD COLUMN {column} {column_type}"),
            [],
        )?;
    }

    Ok(())
}
