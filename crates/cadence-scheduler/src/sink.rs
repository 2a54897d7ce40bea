use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
    clock::Clock,
    db::{from_db_time, from_json, init_db, to_db_time},
    error::{Result, SchedulerError},
    types::{TaskInstance, TaskStatus},
};

/// Receives materialized instances.
///
/// The pipeline may hand over the same occurrence more than once (outbox
/// replay after a crash or a failed delivery); implementations suppress
/// duplicates by `idempotency_key` and return the original instance id.
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn create_instance(&self, instance: &TaskInstance) -> Result<String>;
}

/// Task store backed by the `task_instances` table.
pub struct SqliteTaskSink {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteTaskSink {
    /// Wrap `conn`, initialising the schema if needed. `clock` stamps
    /// `created_at` on new instances.
    pub fn new(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::LockPoisoned("task sink"))
    }

    pub fn find(&self, id: &str) -> Result<Option<TaskInstance>> {
        let conn = self.conn()?;
        let instance = conn
            .query_row(
                "SELECT id, idempotency_key, parent_schedule_id, occurrence_date, status, template
                 FROM task_instances WHERE id = ?1",
                [id],
                row_to_instance,
            )
            .optional()?;
        Ok(instance)
    }

    /// All instances of one schedule, oldest occurrence first.
    pub fn list_for_schedule(&self, schedule_id: &str) -> Result<Vec<TaskInstance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, idempotency_key, parent_schedule_id, occurrence_date, status, template
             FROM task_instances WHERE parent_schedule_id = ?1
             ORDER BY occurrence_date",
        )?;
        let rows = stmt.query_map([schedule_id], row_to_instance)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Change an instance's status and return the updated record.
    #[instrument(skip(self))]
    pub fn set_status(&self, id: &str, status: TaskStatus, at: DateTime<Utc>) -> Result<TaskInstance> {
        let n = self.conn()?.execute(
            "UPDATE task_instances SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.to_string(), to_db_time(at), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::InstanceNotFound { id: id.to_string() });
        }
        self.find(id)?
            .ok_or_else(|| SchedulerError::InstanceNotFound { id: id.to_string() })
    }
}

#[async_trait]
impl TaskSink for SqliteTaskSink {
    async fn create_instance(&self, instance: &TaskInstance) -> Result<String> {
        let conn = self.conn()?;
        let now = to_db_time(self.clock.now());
        let id = Uuid::now_v7().to_string();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO task_instances
             (id, idempotency_key, parent_schedule_id, occurrence_date, status, template,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            rusqlite::params![
                id,
                instance.idempotency_key,
                instance.parent_schedule_id,
                to_db_time(instance.occurrence_date),
                instance.status.to_string(),
                serde_json::to_string(&instance.template)?,
                now,
            ],
        )?;

        if inserted == 1 {
            info!(instance_id = %id, schedule_id = %instance.parent_schedule_id, "task instance created");
            return Ok(id);
        }

        // Replayed occurrence: hand back the id it got the first time.
        let existing: String = conn.query_row(
            "SELECT id FROM task_instances WHERE idempotency_key = ?1",
            [&instance.idempotency_key],
            |row| row.get(0),
        )?;
        debug!(instance_id = %existing, key = %instance.idempotency_key, "duplicate instance suppressed");
        Ok(existing)
    }
}

fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskInstance> {
    let status: String = row.get(4)?;
    let status = status.parse::<TaskStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(TaskInstance {
        id: Some(row.get(0)?),
        idempotency_key: row.get(1)?,
        parent_schedule_id: row.get(2)?,
        occurrence_date: from_db_time(3, &row.get::<_, String>(3)?)?,
        status,
        template: from_json(5, &row.get::<_, String>(5)?)?,
    })
}
