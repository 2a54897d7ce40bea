use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `schedules`, `instance_outbox` and `task_instances` tables
/// (idempotent) plus the indexes the due-query and outbox replay rely on.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedules (
            id                  TEXT    NOT NULL PRIMARY KEY,
            template            TEXT    NOT NULL,   -- JSON-encoded TaskTemplate
            pattern             TEXT    NOT NULL,   -- JSON-encoded RecurrencePattern
            utc_offset_minutes  INTEGER NOT NULL DEFAULT 0,
            cursor              TEXT    NOT NULL,   -- fixed-width RFC 3339 UTC
            occurrence_count    INTEGER NOT NULL DEFAULT 0,
            active              INTEGER NOT NULL DEFAULT 1,
            paused              INTEGER NOT NULL DEFAULT 0,
            awaiting_completion INTEGER NOT NULL DEFAULT 0,
            last_processed_at   TEXT,
            last_error          TEXT,
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL
        ) STRICT;

        -- Due query: WHERE active = 1 AND paused = 0 AND awaiting_completion = 0 AND cursor <= ?
        CREATE INDEX IF NOT EXISTS idx_schedules_due
            ON schedules (active, paused, awaiting_completion, cursor);

        -- Written in the same transaction as the cursor advance. A row lives
        -- only until the task sink has accepted its instance.
        CREATE TABLE IF NOT EXISTS instance_outbox (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            schedule_id      TEXT    NOT NULL,
            idempotency_key  TEXT    NOT NULL UNIQUE,
            payload          TEXT    NOT NULL,   -- JSON-encoded TaskInstance
            created_at       TEXT    NOT NULL
        ) STRICT;

        -- Backing table for SqliteTaskSink.
        CREATE TABLE IF NOT EXISTS task_instances (
            id                 TEXT NOT NULL PRIMARY KEY,
            idempotency_key    TEXT NOT NULL UNIQUE,
            parent_schedule_id TEXT NOT NULL,
            occurrence_date    TEXT NOT NULL,
            status             TEXT NOT NULL DEFAULT 'pending',
            template           TEXT NOT NULL,
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_task_instances_parent
            ON task_instances (parent_schedule_id, occurrence_date);
        ",
    )?;
    Ok(())
}

/// Fixed-width RFC 3339 (`2024-01-01T00:00:00.000Z`) so that string order is
/// time order and CAS equality on stored cursors is exact.
pub fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Drop precision the database cannot hold, so in-memory and stored values agree.
pub fn db_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(3)
}

pub(crate) fn from_db_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}
