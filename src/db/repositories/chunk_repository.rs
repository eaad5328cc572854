use std::convert::TryFrom;

use rusqlite::{named_params, Connection, Row};

use crate::error::ScheduleResult;
use crate::models::plan::ChunkRecord;
use crate::services::time_utils;

#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub capture_id: String,
    pub position: i64,
    pub start_at: String,
    pub end_at: String,
    pub prime: bool,
    pub late: bool,
    pub overlapped: bool,
}

impl ChunkRow {
    pub fn into_record(self) -> ScheduleResult<ChunkRecord> {
        Ok(ChunkRecord {
            start: time_utils::parse_datetime(&self.start_at)?,
            end: time_utils::parse_datetime(&self.end_at)?,
            prime: self.prime,
            late: self.late,
            overlapped: self.overlapped,
        })
    }
}

impl TryFrom<&Row<'_>> for ChunkRow {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'_>) -> Result<Self, Self::Error> {
        Ok(Self {
            capture_id: row.get("capture_id")?,
            position: row.get("position")?,
            start_at: row.get("start_at")?,
            end_at: row.get("end_at")?,
            prime: row.get("prime")?,
            late: row.get("late")?,
            overlapped: row.get("overlapped")?,
        })
    }
}

pub struct ChunkRepository<'a> {
    conn: &'a Connection,
}

impl<'a> ChunkRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Chunks are replaced wholesale on every commit; there is no partial
    /// chunk update.
    pub fn replace_for_capture(
        &self,
        capture_id: &str,
        chunks: &[ChunkRecord],
    ) -> ScheduleResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = self.replace_inner(capture_id, chunks);
        if result.is_ok() {
            self.conn.execute_batch("COMMIT")?;
        } else {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
        result
    }

    fn replace_inner(&self, capture_id: &str, chunks: &[ChunkRecord]) -> ScheduleResult<()> {
        self.conn.execute(
            "DELETE FROM capture_chunks WHERE capture_id = :capture_id",
            named_params! {":capture_id": capture_id},
        )?;

        for (position, chunk) in chunks.iter().enumerate() {
            self.conn.execute(
                r#"
                INSERT INTO capture_chunks (
                    capture_id, position, start_at, end_at, prime, late, overlapped
                ) VALUES (
                    :capture_id, :position, :start_at, :end_at, :prime, :late, :overlapped
                )
                "#,
                named_params! {
                    ":capture_id": capture_id,
                    ":position": position as i64,
                    ":start_at": time_utils::format_datetime(chunk.start),
                    ":end_at": time_utils::format_datetime(chunk.end),
                    ":prime": chunk.prime,
                    ":late": chunk.late,
                    ":overlapped": chunk.overlapped,
                },
            )?;
        }

        Ok(())
    }

    pub fn list_for_capture(&self, capture_id: &str) -> ScheduleResult<Vec<ChunkRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM capture_chunks WHERE capture_id = :capture_id ORDER BY position",
        )?;
        let rows = stmt.query_map(named_params! {":capture_id": capture_id}, |row| {
            ChunkRow::try_from(row)
        })?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?.into_record()?);
        }
        Ok(chunks)
    }

    /// Flip every chunk of a capture to overlapped, used when a later
    /// commit co-schedules on top of it.
    pub fn mark_overlapped(&self, capture_id: &str, prime: bool) -> ScheduleResult<()> {
        self.conn.execute(
            "UPDATE capture_chunks SET overlapped = 1, prime = :prime WHERE capture_id = :capture_id",
            named_params! {":capture_id": capture_id, ":prime": prime},
        )?;
        Ok(())
    }
}
