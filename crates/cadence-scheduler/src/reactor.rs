use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
    clock::Clock,
    db::db_precision,
    error::{Result, SchedulerError},
    schedule::add_months,
    sink::SqliteTaskSink,
    store::ScheduleStore,
    types::{RecurrencePattern, TaskInstance, TaskStatus},
};

/// Result of handling one completion event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompletionOutcome {
    /// The parent schedule was re-armed with a new cursor.
    Rearmed { schedule_id: String, cursor: DateTime<Utc> },
    /// Nothing to do; `reason` says why.
    Ignored { reason: String },
}

impl CompletionOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        CompletionOutcome::Ignored {
            reason: reason.into(),
        }
    }
}

/// Re-arms completion-driven schedules when their current instance is done.
///
/// Calendar-driven schedules are never touched here; the pipeline owns them.
pub struct CompletionReactor {
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
}

impl CompletionReactor {
    pub fn new(store: Arc<dyn ScheduleStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// React to `instance` reaching `Complete` at `completed_at`.
    ///
    /// The new cursor is `completed_at + months_after`, except for a completion
    /// back-dated before the outstanding occurrence: then it is
    /// `old cursor + months_after`, so the series still moves strictly forward
    /// and no occurrence is produced twice.
    ///
    /// Duplicate or stale completion events (an older instance, a schedule
    /// that was already re-armed) are ignored.
    #[instrument(skip(self, instance), fields(schedule_id = %instance.parent_schedule_id))]
    pub async fn on_instance_completed(
        &self,
        instance: &TaskInstance,
        completed_at: DateTime<Utc>,
    ) -> Result<CompletionOutcome> {
        let Some(schedule) = self.store.get(&instance.parent_schedule_id).await? else {
            return Ok(CompletionOutcome::ignored("parent schedule not found"));
        };
        if !schedule.active {
            return Ok(CompletionOutcome::ignored("parent schedule retired"));
        }
        let RecurrencePattern::RegenerateAfterCompletion { months_after } = schedule.pattern else {
            return Ok(CompletionOutcome::ignored("parent schedule is calendar-driven"));
        };
        if !schedule.awaiting_completion || instance.occurrence_date != schedule.cursor {
            debug!("completion does not belong to the outstanding occurrence");
            return Ok(CompletionOutcome::ignored("not the outstanding occurrence"));
        }

        let offset = schedule.offset()?;
        let months_from = |from: DateTime<Utc>| {
            add_months(from.with_timezone(&offset), months_after)
                .map(|c| db_precision(c.with_timezone(&Utc)))
                .ok_or_else(|| {
                    SchedulerError::InvalidSchedule(format!("cannot add {months_after} months to {from}"))
                })
        };
        // A back-dated completion still lands strictly after the outstanding occurrence.
        let cursor = months_from(completed_at)?.max(months_from(schedule.cursor)?);

        let now = db_precision(self.clock.now());
        if !self.store.rearm(&schedule.id, schedule.cursor, cursor, now).await? {
            return Ok(CompletionOutcome::ignored("schedule changed concurrently"));
        }
        info!(%cursor, "completion-driven schedule re-armed");

        Ok(CompletionOutcome::Rearmed {
            schedule_id: schedule.id,
            cursor,
        })
    }
}

/// Completion source for instances stored by [`SqliteTaskSink`]: every
/// status change goes through here so completions reach the reactor.
pub struct CompletionHook {
    sink: Arc<SqliteTaskSink>,
    reactor: CompletionReactor,
}

impl CompletionHook {
    pub fn new(sink: Arc<SqliteTaskSink>, reactor: CompletionReactor) -> Self {
        Self { sink, reactor }
    }

    /// Set the instance's status; a transition to `Complete` notifies the reactor.
    pub async fn transition(
        &self,
        instance_id: &str,
        status: TaskStatus,
        at: DateTime<Utc>,
    ) -> Result<(TaskInstance, Option<CompletionOutcome>)> {
        let previous = self
            .sink
            .find(instance_id)?
            .ok_or_else(|| SchedulerError::InstanceNotFound {
                id: instance_id.to_string(),
            })?;
        let instance = self.sink.set_status(instance_id, status, at)?;

        if status != TaskStatus::Complete || previous.status == TaskStatus::Complete {
            return Ok((instance, None));
        }
        let outcome = self.reactor.on_instance_completed(&instance, at).await?;
        Ok((instance, Some(outcome)))
    }
}
