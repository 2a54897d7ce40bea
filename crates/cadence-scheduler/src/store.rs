use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::{
    db::{db_precision, from_db_time, from_json, init_db, to_db_time},
    error::{Result, SchedulerError},
    schedule::{initial_occurrence, next_occurrence},
    types::{NewSchedule, RecurrencePattern, ScheduleDefinition, TaskInstance, TaskTemplate},
};

/// What happens to a schedule's cursor once its current occurrence is materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Move the cursor to the next calendar occurrence.
    MoveTo(DateTime<Utc>),
    /// The series has ended; the schedule becomes permanently inactive.
    Retire,
    /// Completion-driven: keep the cursor and wait for the completion reactor.
    AwaitCompletion,
}

/// One occurrence's unit of work: cursor transition plus the instance it produced.
#[derive(Debug, Clone)]
pub struct Materialization {
    pub schedule_id: String,
    /// Cursor as read by the pipeline; the write only applies if it is unchanged.
    pub expected_cursor: DateTime<Utc>,
    pub advance: Advance,
    pub instance: TaskInstance,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Cursor moved and the instance was queued under this outbox id.
    Committed { outbox_id: i64 },
    /// Another invocation got there first; nothing was written.
    Conflict,
}

/// An instance that has been committed but not yet accepted by the task sink.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    pub instance: TaskInstance,
}

/// Persistence seam consumed by the pipeline and the completion reactor.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Active, unpaused schedules whose cursor is at or before `at`.
    async fn find_active_due_before(&self, at: DateTime<Utc>) -> Result<Vec<ScheduleDefinition>>;

    async fn get(&self, id: &str) -> Result<Option<ScheduleDefinition>>;

    /// Apply `m.advance` and queue `m.instance` atomically, provided the
    /// stored cursor still equals `m.expected_cursor`.
    async fn compare_and_advance(&self, m: &Materialization) -> Result<CommitOutcome>;

    /// Move a completion-driven schedule out of its waiting state. Returns
    /// `false` if the schedule was not waiting at `expected_cursor`.
    async fn rearm(
        &self,
        id: &str,
        expected_cursor: DateTime<Utc>,
        new_cursor: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Stamp a failed attempt. Leaves cursor and count untouched.
    async fn record_error(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<()>;

    /// Oldest undelivered outbox rows first.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// The sink accepted the row's instance; drop it from the outbox.
    async fn mark_delivered(&self, outbox_id: i64) -> Result<()>;
}

const SCHEDULE_COLUMNS: &str = "id, template, pattern, utc_offset_minutes, cursor, occurrence_count,
     active, paused, awaiting_completion, last_processed_at, last_error, created_at, updated_at";

/// SQLite-backed schedule store.
///
/// Wraps a single connection in a `Mutex`; every multi-statement write runs
/// inside one transaction so the cursor and the outbox row commit together.
pub struct SqliteScheduleStore {
    conn: Mutex<Connection>,
}

impl SqliteScheduleStore {
    /// Wrap `conn`, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::LockPoisoned("schedule store"))
    }

    /// Create an active schedule with `occurrence_count = 0`.
    ///
    /// The initial cursor comes from `start`, sought forward to a listed
    /// weekday for weekly patterns.
    #[instrument(skip(self, new), fields(title = %new.template.title))]
    pub fn create(&self, new: NewSchedule, now: DateTime<Utc>) -> Result<ScheduleDefinition> {
        new.pattern.validate()?;
        let offset = FixedOffset::east_opt(new.utc_offset_minutes.saturating_mul(60)).ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!(
                "utc offset out of range: {} minutes",
                new.utc_offset_minutes
            ))
        })?;

        let start = new.start.with_timezone(&offset);
        let cursor = db_precision(initial_occurrence(&new.pattern, start).with_timezone(&Utc));
        let now = db_precision(now);
        let id = Uuid::now_v7().to_string();

        self.conn()?.execute(
            "INSERT INTO schedules
             (id, template, pattern, utc_offset_minutes, cursor, occurrence_count,
              active, paused, awaiting_completion, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,0,1,0,0,?6,?6)",
            rusqlite::params![
                id,
                serde_json::to_string(&new.template)?,
                serde_json::to_string(&new.pattern)?,
                new.utc_offset_minutes,
                to_db_time(cursor),
                to_db_time(now),
            ],
        )?;
        info!(schedule_id = %id, cursor = %cursor, "schedule created");

        Ok(ScheduleDefinition {
            id,
            template: new.template,
            pattern: new.pattern,
            utc_offset_minutes: new.utc_offset_minutes,
            cursor,
            occurrence_count: 0,
            active: true,
            paused: false,
            awaiting_completion: false,
            last_processed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn find(&self, id: &str) -> Result<Option<ScheduleDefinition>> {
        let conn = self.conn()?;
        let schedule = conn
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                [id],
                row_to_schedule,
            )
            .optional()?;
        Ok(schedule)
    }

    /// Return all schedules ordered by creation time.
    pub fn list(&self) -> Result<Vec<ScheduleDefinition>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([], row_to_schedule)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    #[instrument(skip(self))]
    pub fn pause(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.set_paused(id, true, now)
    }

    /// Resume a paused schedule. A cursor already in the past fires on the next tick.
    #[instrument(skip(self))]
    pub fn resume(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.set_paused(id, false, now)
    }

    fn set_paused(&self, id: &str, paused: bool, now: DateTime<Utc>) -> Result<()> {
        let n = self.conn()?.execute(
            "UPDATE schedules SET paused = ?1, updated_at = ?2 WHERE id = ?3 AND active = 1",
            rusqlite::params![paused, to_db_time(now), id],
        )?;
        if n == 0 {
            return Err(self.missing_or_retired(id));
        }
        info!(schedule_id = %id, paused, "schedule pause state changed");
        Ok(())
    }

    /// Replace the recurrence pattern. The count is kept, and so is the cursor
    /// unless the schedule was parked on an already materialized occurrence.
    #[instrument(skip(self, pattern))]
    pub fn update_pattern(&self, id: &str, pattern: &RecurrencePattern, now: DateTime<Utc>) -> Result<()> {
        pattern.validate()?;
        let current = self
            .find(id)?
            .ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })?;
        if !current.active {
            return Err(SchedulerError::InvalidSchedule(format!("schedule {id} is retired")));
        }

        // Leaving completion-driven mode while parked: the parked occurrence
        // exists already, so the new series starts after it.
        let release = current.awaiting_completion && !pattern.is_completion_driven();
        let cursor = if release {
            let offset = current.offset()?;
            next_occurrence(pattern, current.cursor.with_timezone(&offset))
                .map(|c| db_precision(c.with_timezone(&Utc)))
                .ok_or_else(|| {
                    SchedulerError::InvalidSchedule(format!(
                        "pattern has no occurrence after {}",
                        current.cursor
                    ))
                })?
        } else {
            current.cursor
        };

        let n = self.conn()?.execute(
            "UPDATE schedules
             SET pattern = ?1, cursor = ?2,
                 awaiting_completion = CASE WHEN ?3 THEN 0 ELSE awaiting_completion END,
                 updated_at = ?4
             WHERE id = ?5 AND cursor = ?6 AND active = 1",
            rusqlite::params![
                serde_json::to_string(pattern)?,
                to_db_time(cursor),
                release,
                to_db_time(now),
                id,
                to_db_time(current.cursor),
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::InvalidSchedule(format!(
                "schedule {id} changed while updating its pattern"
            )));
        }
        info!(schedule_id = %id, %cursor, "schedule pattern updated");
        Ok(())
    }

    /// Replace the template copied onto future instances.
    #[instrument(skip(self, template))]
    pub fn update_template(&self, id: &str, template: &TaskTemplate, now: DateTime<Utc>) -> Result<()> {
        let n = self.conn()?.execute(
            "UPDATE schedules SET template = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![serde_json::to_string(template)?, to_db_time(now), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Remove a schedule by ID. Returns `ScheduleNotFound` if no row is deleted.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &str) -> Result<()> {
        let n = self.conn()?.execute("DELETE FROM schedules WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: id.to_string() });
        }
        info!(schedule_id = %id, "schedule removed");
        Ok(())
    }

    fn missing_or_retired(&self, id: &str) -> SchedulerError {
        match self.find(id) {
            Ok(Some(_)) => SchedulerError::InvalidSchedule(format!("schedule {id} is retired")),
            Ok(None) => SchedulerError::ScheduleNotFound { id: id.to_string() },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn find_active_due_before(&self, at: DateTime<Utc>) -> Result<Vec<ScheduleDefinition>> {
        let conn = self.conn()?;
        let rows: Vec<(String, rusqlite::Result<ScheduleDefinition>)> = {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules
                 WHERE active = 1 AND paused = 0 AND awaiting_completion = 0 AND cursor <= ?1"
            ))?;
            let mapped = stmt.query_map([to_db_time(at)], |row| {
                Ok((row.get::<_, String>(0)?, row_to_schedule(row)))
            })?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()?
        };

        // An undecodable row is that schedule's problem, not the batch's:
        // flag it for the operator and leave it out of this tick.
        let mut due = Vec::with_capacity(rows.len());
        for (id, parsed) in rows {
            match parsed {
                Ok(schedule) => due.push(schedule),
                Err(e) => {
                    error!(schedule_id = %id, "undecodable schedule row: {e}");
                    conn.execute(
                        "UPDATE schedules SET last_error = ?1, last_processed_at = ?2, updated_at = ?2
                         WHERE id = ?3",
                        rusqlite::params![format!("undecodable schedule: {e}"), to_db_time(at), id],
                    )?;
                }
            }
        }
        Ok(due)
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduleDefinition>> {
        self.find(id)
    }

    async fn compare_and_advance(&self, m: &Materialization) -> Result<CommitOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let at = to_db_time(m.processed_at);
        let expected = to_db_time(m.expected_cursor);

        const GUARD: &str =
            "WHERE id = ?1 AND cursor = ?2 AND active = 1 AND paused = 0 AND awaiting_completion = 0";
        let n = match &m.advance {
            Advance::MoveTo(next) => tx.execute(
                &format!(
                    "UPDATE schedules
                     SET cursor = ?4, occurrence_count = occurrence_count + 1,
                         last_processed_at = ?3, last_error = NULL, updated_at = ?3
                     {GUARD}"
                ),
                rusqlite::params![m.schedule_id, expected, at, to_db_time(*next)],
            )?,
            Advance::Retire => tx.execute(
                &format!(
                    "UPDATE schedules
                     SET active = 0, occurrence_count = occurrence_count + 1,
                         last_processed_at = ?3, last_error = NULL, updated_at = ?3
                     {GUARD}"
                ),
                rusqlite::params![m.schedule_id, expected, at],
            )?,
            Advance::AwaitCompletion => tx.execute(
                &format!(
                    "UPDATE schedules
                     SET awaiting_completion = 1, occurrence_count = occurrence_count + 1,
                         last_processed_at = ?3, last_error = NULL, updated_at = ?3
                     {GUARD}"
                ),
                rusqlite::params![m.schedule_id, expected, at],
            )?,
        };

        if n == 0 {
            // dropping `tx` rolls back
            debug!(schedule_id = %m.schedule_id, "cursor moved underneath us; skipping");
            return Ok(CommitOutcome::Conflict);
        }

        tx.execute(
            "INSERT INTO instance_outbox (schedule_id, idempotency_key, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                m.schedule_id,
                m.instance.idempotency_key,
                serde_json::to_string(&m.instance)?,
                at
            ],
        )?;
        let outbox_id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(CommitOutcome::Committed { outbox_id })
    }

    async fn rearm(
        &self,
        id: &str,
        expected_cursor: DateTime<Utc>,
        new_cursor: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let n = self.conn()?.execute(
            "UPDATE schedules
             SET cursor = ?1, awaiting_completion = 0,
                 last_processed_at = ?2, last_error = NULL, updated_at = ?2
             WHERE id = ?3 AND cursor = ?4 AND active = 1 AND awaiting_completion = 1",
            rusqlite::params![
                to_db_time(new_cursor),
                to_db_time(at),
                id,
                to_db_time(expected_cursor)
            ],
        )?;
        Ok(n == 1)
    }

    async fn record_error(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<()> {
        let n = self.conn()?.execute(
            "UPDATE schedules SET last_error = ?1, last_processed_at = ?2, updated_at = ?2
             WHERE id = ?3",
            rusqlite::params![error, to_db_time(at), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, payload FROM instance_outbox ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt.query_map([i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
            Ok(OutboxEntry {
                id: row.get(0)?,
                instance: from_json(1, &row.get::<_, String>(1)?)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn mark_delivered(&self, outbox_id: i64) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM instance_outbox WHERE id = ?1", [outbox_id])?;
        Ok(())
    }
}

/// Map a SQLite row (in `SCHEDULE_COLUMNS` order) to a `ScheduleDefinition`.
fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleDefinition> {
    let last_processed_at = row
        .get::<_, Option<String>>(9)?
        .map(|raw| from_db_time(9, &raw))
        .transpose()?;

    Ok(ScheduleDefinition {
        id: row.get(0)?,
        template: from_json(1, &row.get::<_, String>(1)?)?,
        pattern: from_json(2, &row.get::<_, String>(2)?)?,
        utc_offset_minutes: row.get(3)?,
        cursor: from_db_time(4, &row.get::<_, String>(4)?)?,
        occurrence_count: row.get(5)?,
        active: row.get(6)?,
        paused: row.get(7)?,
        awaiting_completion: row.get(8)?,
        last_processed_at,
        last_error: row.get(10)?,
        created_at: from_db_time(11, &row.get::<_, String>(11)?)?,
        updated_at: from_db_time(12, &row.get::<_, String>(12)?)?,
    })
}
