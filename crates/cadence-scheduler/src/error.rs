use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored JSON column (pattern, template, instance payload) failed to (de)serialise.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The recurrence pattern is malformed (zero interval, empty weekday set, ...).
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// The schedule itself is unusable (bad offset, non-advancing cursor, retired).
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No schedule with the given ID exists in the store.
    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: String },

    /// No task instance with the given ID exists in the sink.
    #[error("Task instance not found: {id}")]
    InstanceNotFound { id: String },

    /// A per-schedule operation exceeded its time budget.
    #[error("Timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The task sink refused or failed to create an instance. For `TaskSink`
    /// implementations that deliver into an external task system; the
    /// pipeline treats it as transient and replays the outbox row later.
    #[error("Task sink error: {0}")]
    Sink(String),

    /// The notifier could not accept an event.
    #[error("Notifier error: {0}")]
    Notify(String),

    /// A mutex guarding a connection was poisoned by a panicking holder.
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl SchedulerError {
    /// Definition faults that retrying will not fix; an operator has to edit
    /// the schedule. Everything else is expected to clear up on a later tick.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidPattern(_)
                | SchedulerError::InvalidSchedule(_)
                | SchedulerError::Serialization(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
