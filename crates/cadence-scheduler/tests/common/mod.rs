#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadence_scheduler::{
    Clock, CommitOutcome, FixedClock, Materialization, MaterializationPipeline, NewSchedule, OutboxEntry,
    PipelineOptions, RecurrencePattern, Result, ScheduleDefinition, ScheduleStore, SchedulerError,
    SqliteScheduleStore, SqliteTaskSink, TaskInstance, TaskSink, TaskTemplate,
};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

pub fn template(title: &str) -> TaskTemplate {
    TaskTemplate {
        title: title.to_string(),
        assignees: vec!["alex".into()],
        group_id: Some("home".into()),
        ..TaskTemplate::default()
    }
}

pub fn new_schedule(title: &str, pattern: RecurrencePattern, start: DateTime<Utc>) -> NewSchedule {
    NewSchedule {
        template: template(title),
        pattern,
        start,
        utc_offset_minutes: 0,
    }
}

pub fn options() -> PipelineOptions {
    PipelineOptions {
        max_concurrency: 4,
        schedule_timeout: Duration::from_secs(5),
        batch_budget: None,
        outbox_batch: 100,
    }
}

pub struct Harness {
    pub store: Arc<SqliteScheduleStore>,
    pub sink: Arc<SqliteTaskSink>,
    pub clock: Arc<FixedClock>,
}

impl Harness {
    pub fn new(now: DateTime<Utc>) -> Self {
        let clock = Arc::new(FixedClock::new(now));
        Self {
            store: Arc::new(SqliteScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap()),
            sink: Arc::new(SqliteTaskSink::new(Connection::open_in_memory().unwrap(), clock.clone()).unwrap()),
            clock,
        }
    }

    pub fn pipeline(&self) -> MaterializationPipeline {
        self.pipeline_over(self.store.clone())
    }

    pub fn pipeline_over(&self, store: Arc<dyn ScheduleStore>) -> MaterializationPipeline {
        MaterializationPipeline::new(store, self.sink.clone(), self.clock.clone()).with_options(options())
    }

    pub fn add(&self, new: NewSchedule) -> ScheduleDefinition {
        self.store.create(new, self.clock.now()).unwrap()
    }

    pub fn reload(&self, id: &str) -> ScheduleDefinition {
        self.store.find(id).unwrap().expect("schedule exists")
    }

    pub fn instances(&self, schedule_id: &str) -> Vec<TaskInstance> {
        self.sink.list_for_schedule(schedule_id).unwrap()
    }
}

/// Store wrapper that fails or stalls the commit for chosen schedules.
pub struct FaultyStore {
    pub inner: Arc<SqliteScheduleStore>,
    pub fail_commit: Mutex<HashSet<String>>,
    pub stall_commit: Option<Duration>,
}

impl FaultyStore {
    pub fn failing(inner: Arc<SqliteScheduleStore>, ids: &[&str]) -> Self {
        Self {
            inner,
            fail_commit: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
            stall_commit: None,
        }
    }

    pub fn stalling(inner: Arc<SqliteScheduleStore>, by: Duration) -> Self {
        Self {
            inner,
            fail_commit: Mutex::new(HashSet::new()),
            stall_commit: Some(by),
        }
    }
}

#[async_trait]
impl ScheduleStore for FaultyStore {
    async fn find_active_due_before(&self, at: DateTime<Utc>) -> Result<Vec<ScheduleDefinition>> {
        self.inner.find_active_due_before(at).await
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduleDefinition>> {
        self.inner.get(id).await
    }

    async fn compare_and_advance(&self, m: &Materialization) -> Result<CommitOutcome> {
        if let Some(by) = self.stall_commit {
            tokio::time::sleep(by).await;
        }
        if self.fail_commit.lock().unwrap().contains(&m.schedule_id) {
            return Err(SchedulerError::Database(rusqlite::Error::InvalidQuery));
        }
        self.inner.compare_and_advance(m).await
    }

    async fn rearm(
        &self,
        id: &str,
        expected_cursor: DateTime<Utc>,
        new_cursor: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.rearm(id, expected_cursor, new_cursor, at).await
    }

    async fn record_error(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.record_error(id, error, at).await
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        self.inner.pending_outbox(limit).await
    }

    async fn mark_delivered(&self, outbox_id: i64) -> Result<()> {
        self.inner.mark_delivered(outbox_id).await
    }
}

/// Sink wrapper that rejects the first `failures` deliveries.
pub struct FlakySink {
    pub inner: Arc<SqliteTaskSink>,
    pub failures: AtomicUsize,
}

#[async_trait]
impl TaskSink for FlakySink {
    async fn create_instance(&self, instance: &TaskInstance) -> Result<String> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SchedulerError::Sink("task store unavailable".into()));
        }
        self.inner.create_instance(instance).await
    }
}

/// Sink wrapper that hangs for `by` on each of its first `stalls` deliveries.
pub struct StallingSink {
    pub inner: Arc<SqliteTaskSink>,
    pub stalls: AtomicUsize,
    pub by: Duration,
}

impl StallingSink {
    pub fn new(inner: Arc<SqliteTaskSink>, stalls: usize, by: Duration) -> Self {
        Self {
            inner,
            stalls: AtomicUsize::new(stalls),
            by,
        }
    }
}

#[async_trait]
impl TaskSink for StallingSink {
    async fn create_instance(&self, instance: &TaskInstance) -> Result<String> {
        // counted before sleeping: a cancelled call still uses up its stall
        let remaining = self.stalls.load(Ordering::SeqCst);
        if remaining > 0 {
            self.stalls.store(remaining - 1, Ordering::SeqCst);
            tokio::time::sleep(self.by).await;
        }
        self.inner.create_instance(instance).await
    }
}
