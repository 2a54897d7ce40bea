use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::SchedulerConfig;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    db::db_precision,
    error::{Result, SchedulerError},
    notify::Notifier,
    schedule::{next_occurrence, series_should_end},
    sink::TaskSink,
    store::{Advance, CommitOutcome, Materialization, ScheduleStore},
    types::{ScheduleDefinition, ScheduleEvent, TaskInstance},
};

/// Tuning knobs for one `run_once` call.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub max_concurrency: usize,
    pub schedule_timeout: Duration,
    /// `None` lets a tick run until every due schedule has been handled.
    pub batch_budget: Option<Duration>,
    pub outbox_batch: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for PipelineOptions {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            max_concurrency: cfg.max_concurrency.max(1),
            schedule_timeout: cfg.schedule_timeout(),
            batch_budget: cfg.batch_budget(),
            outbox_batch: cfg.outbox_batch,
        }
    }
}

/// A schedule that could not be processed (or whose instance could not be
/// delivered yet) during a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleFailure {
    pub schedule_id: String,
    pub error: String,
    /// True when retrying cannot help until the schedule is edited.
    pub permanent: bool,
}

/// Aggregate outcome of one `run_once`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Instances created (including the one produced by a retiring run).
    pub materialized: usize,
    /// Schedules whose series ended during this tick.
    pub retired: usize,
    /// Schedules left untouched because processing failed.
    pub failed: usize,
    /// Schedules another invocation materialized first.
    pub conflicts: usize,
    /// Instances from earlier ticks handed to the sink on this one.
    pub redelivered: usize,
    /// The batch budget ran out before every due schedule was handled.
    pub timed_out: bool,
    pub errors: Vec<ScheduleFailure>,
}

/// What the trigger entrypoint reports back to its caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub processed_count: usize,
    pub errors: Vec<ScheduleFailure>,
}

impl From<BatchResult> for ProcessReport {
    fn from(result: BatchResult) -> Self {
        Self {
            processed_count: result.materialized,
            errors: result.errors,
        }
    }
}

enum Outcome {
    Materialized {
        retired: bool,
        delivery_failure: Option<ScheduleFailure>,
    },
    Conflict,
    Failed(ScheduleFailure),
}

impl BatchResult {
    fn absorb(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Materialized {
                retired,
                delivery_failure,
            } => {
                self.materialized += 1;
                if retired {
                    self.retired += 1;
                }
                self.errors.extend(delivery_failure);
            }
            Outcome::Conflict => self.conflicts += 1,
            Outcome::Failed(failure) => {
                self.failed += 1;
                self.errors.push(failure);
            }
        }
    }
}

/// Decide how `schedule` moves on after its current occurrence is materialized.
pub fn plan_advance(schedule: &ScheduleDefinition) -> Result<Advance> {
    schedule.pattern.validate()?;

    let Some(end) = schedule.pattern.series_end() else {
        return Ok(Advance::AwaitCompletion);
    };

    let offset = schedule.offset()?;
    let candidate = next_occurrence(&schedule.pattern, schedule.cursor.with_timezone(&offset))
        .map(|c| db_precision(c.with_timezone(&Utc)));
    let count_after = schedule.occurrence_count.saturating_add(1);

    match candidate {
        None => Ok(Advance::Retire),
        Some(next) if series_should_end(end, count_after, next) => Ok(Advance::Retire),
        Some(next) if next <= schedule.cursor => Err(SchedulerError::InvalidSchedule(format!(
            "next occurrence {next} does not advance past cursor {}",
            schedule.cursor
        ))),
        Some(next) => Ok(Advance::MoveTo(next)),
    }
}

/// Batch driver: turns every due schedule into one task instance and moves
/// its cursor on, isolating failures per schedule.
pub struct MaterializationPipeline {
    store: Arc<dyn ScheduleStore>,
    sink: Arc<dyn TaskSink>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Arc<dyn Clock>,
    options: PipelineOptions,
}

impl MaterializationPipeline {
    pub fn new(store: Arc<dyn ScheduleStore>, sink: Arc<dyn TaskSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            sink,
            notifier: None,
            clock,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Trigger entrypoint. Safe to call more often than necessary and from
    /// several places at once: each occurrence is materialized exactly once.
    pub async fn process_due_schedules(&self) -> Result<ProcessReport> {
        let result = self.run_once(self.clock.now()).await?;
        Ok(result.into())
    }

    /// Materialize every schedule due at `now`.
    ///
    /// Only fails outright when the store cannot be queried at all; anything
    /// that goes wrong with an individual schedule is recorded on it and
    /// reported in [`BatchResult::errors`].
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<BatchResult> {
        let now = db_precision(now);
        let deadline = self
            .options
            .batch_budget
            .map(|budget| tokio::time::Instant::now() + budget);

        let mut result = BatchResult::default();
        let replayed = within(deadline, self.replay_outbox(now, &mut result.redelivered)).await;
        if replayed.is_none() {
            warn!("batch budget exhausted during outbox replay");
            result.timed_out = true;
            return Ok(result);
        }

        let due = self.store.find_active_due_before(now).await?;
        if due.is_empty() {
            debug!("no schedules due");
            return Ok(result);
        }
        info!(count = due.len(), "materializing due schedules");

        let mut outcomes = std::pin::pin!(stream::iter(due)
            .map(|schedule| self.process_guarded(schedule, now))
            .buffer_unordered(self.options.max_concurrency.max(1)));

        loop {
            let Some(next) = within(deadline, outcomes.next()).await else {
                // In-flight work is dropped at an await point; anything
                // already committed sits in the outbox for the next tick.
                warn!("batch budget exhausted, returning partial results");
                result.timed_out = true;
                break;
            };
            let Some(outcome) = next else { break };
            result.absorb(outcome);
        }

        info!(
            materialized = result.materialized,
            retired = result.retired,
            failed = result.failed,
            conflicts = result.conflicts,
            "tick complete"
        );
        Ok(result)
    }

    // --- private helpers ---------------------------------------------------

    /// Run one schedule and turn any pre-commit error into a recorded failure.
    ///
    /// The schedule timeout bounds planning and the cursor commit. Once the
    /// commit has landed the schedule counts as materialized whatever happens
    /// to delivery.
    async fn process_guarded(&self, schedule: ScheduleDefinition, now: DateTime<Utc>) -> Outcome {
        let timeout = self.options.schedule_timeout;
        let err = match tokio::time::timeout(timeout, self.commit(&schedule, now)).await {
            Ok(Ok(Some(committed))) => return self.hand_over(&schedule, committed, now).await,
            Ok(Ok(None)) => return Outcome::Conflict,
            Ok(Err(e)) => e,
            Err(_) => self.timeout_error(),
        };

        let permanent = err.is_permanent();
        if permanent {
            error!(schedule_id = %schedule.id, "schedule cannot be materialized: {err}");
        } else {
            warn!(schedule_id = %schedule.id, "schedule processing failed, will retry: {err}");
        }

        let message = err.to_string();
        if let Err(e) = self.store.record_error(&schedule.id, &message, now).await {
            error!(schedule_id = %schedule.id, "could not record schedule error: {e}");
        }

        Outcome::Failed(ScheduleFailure {
            schedule_id: schedule.id,
            error: message,
            permanent,
        })
    }

    /// Plan the advance and apply it together with the outbox row.
    /// `None` means a concurrent tick took this occurrence.
    async fn commit(&self, schedule: &ScheduleDefinition, now: DateTime<Utc>) -> Result<Option<Committed>> {
        let advance = plan_advance(schedule)?;
        let m = Materialization {
            schedule_id: schedule.id.clone(),
            expected_cursor: schedule.cursor,
            advance,
            instance: TaskInstance::materialize(schedule),
            processed_at: now,
        };

        match self.store.compare_and_advance(&m).await? {
            CommitOutcome::Committed { outbox_id } => {
                info!(
                    schedule_id = %schedule.id,
                    occurrence = %schedule.cursor,
                    advance = ?m.advance,
                    "occurrence materialized"
                );
                Ok(Some(Committed {
                    outbox_id,
                    retired: m.advance == Advance::Retire,
                    instance: m.instance,
                }))
            }
            CommitOutcome::Conflict => {
                debug!(schedule_id = %schedule.id, "occurrence already taken by a concurrent tick");
                Ok(None)
            }
        }
    }

    /// Deliver a freshly committed instance and announce it.
    ///
    /// The instance is durable in the outbox, so a failed or slow delivery
    /// only postpones its hand-over to the sink.
    async fn hand_over(&self, schedule: &ScheduleDefinition, committed: Committed, now: DateTime<Utc>) -> Outcome {
        let (instance_id, delivery_failure) =
            match self.deliver_bounded(committed.outbox_id, &committed.instance).await {
                Ok(id) => (Some(id), None),
                Err(e) => {
                    warn!(schedule_id = %schedule.id, "instance delivery deferred: {e}");
                    let message = format!("instance delivery deferred: {e}");
                    if let Err(e) = self.store.record_error(&schedule.id, &message, now).await {
                        error!(schedule_id = %schedule.id, "could not record delivery error: {e}");
                    }
                    let failure = ScheduleFailure {
                        schedule_id: schedule.id.clone(),
                        error: message,
                        permanent: false,
                    };
                    (None, Some(failure))
                }
            };

        self.announce(schedule, &committed.instance, instance_id, committed.retired)
            .await;

        Outcome::Materialized {
            retired: committed.retired,
            delivery_failure,
        }
    }

    /// Hand one outbox row to the sink, giving up after the schedule timeout.
    async fn deliver_bounded(&self, outbox_id: i64, instance: &TaskInstance) -> Result<String> {
        let deliver = async {
            let instance_id = self.sink.create_instance(instance).await?;
            self.store.mark_delivered(outbox_id).await?;
            Ok::<_, SchedulerError>(instance_id)
        };
        tokio::time::timeout(self.options.schedule_timeout, deliver)
            .await
            .unwrap_or_else(|_| Err(self.timeout_error()))
    }

    /// Hand undelivered instances from earlier ticks to the sink again,
    /// counting successes into `delivered` as they happen.
    async fn replay_outbox(&self, now: DateTime<Utc>, delivered: &mut usize) {
        let pending = match self.store.pending_outbox(self.options.outbox_batch).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("outbox replay skipped: {e}");
                return;
            }
        };

        for entry in pending {
            match self.deliver_bounded(entry.id, &entry.instance).await {
                Ok(instance_id) => {
                    debug!(outbox_id = entry.id, %instance_id, "outbox entry delivered");
                    *delivered += 1;
                }
                Err(e) => {
                    warn!(outbox_id = entry.id, "outbox entry still undeliverable: {e}");
                    let message = format!("instance delivery deferred: {e}");
                    let schedule_id = &entry.instance.parent_schedule_id;
                    if let Err(e) = self.store.record_error(schedule_id, &message, now).await {
                        debug!(%schedule_id, "could not record delivery error: {e}");
                    }
                }
            }
        }
        if *delivered > 0 {
            info!(count = *delivered, "replayed undelivered instances");
        }
    }

    /// Best-effort notification; failures never affect the schedule's outcome.
    async fn announce(
        &self,
        schedule: &ScheduleDefinition,
        instance: &TaskInstance,
        instance_id: Option<String>,
        retired: bool,
    ) {
        let Some(notifier) = &self.notifier else {
            return;
        };

        let mut events = vec![ScheduleEvent::Materialized {
            schedule_id: schedule.id.clone(),
            instance_id,
            occurrence_date: instance.occurrence_date,
            title: instance.template.title.clone(),
            assignees: instance.template.assignees.clone(),
        }];
        if retired {
            events.push(ScheduleEvent::Retired {
                schedule_id: schedule.id.clone(),
                occurrence_count: schedule.occurrence_count.saturating_add(1),
            });
        }

        for event in &events {
            match tokio::time::timeout(self.options.schedule_timeout, notifier.notify(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(schedule_id = %schedule.id, "notification dropped: {e}"),
                Err(_) => warn!(schedule_id = %schedule.id, "notification timed out"),
            }
        }
    }

    fn timeout_error(&self) -> SchedulerError {
        SchedulerError::Timeout {
            ms: u64::try_from(self.options.schedule_timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// A cursor advance that has been committed together with its outbox row.
struct Committed {
    outbox_id: i64,
    retired: bool,
    instance: TaskInstance,
}

/// Await `fut`, or give up at `deadline` and return `None`.
async fn within<F: std::future::Future>(deadline: Option<tokio::time::Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MonthlyRule, RecurrencePattern, SeriesEnd, TaskTemplate};
    use chrono::TimeZone;

    fn schedule(pattern: RecurrencePattern, cursor: DateTime<Utc>, count: u32) -> ScheduleDefinition {
        ScheduleDefinition {
            id: "s-1".into(),
            template: TaskTemplate::default(),
            pattern,
            utc_offset_minutes: 0,
            cursor,
            occurrence_count: count,
            active: true,
            paused: false,
            awaiting_completion: false,
            last_processed_at: None,
            last_error: None,
            created_at: cursor,
            updated_at: cursor,
        }
    }

    fn jan(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn plan_moves_cursor_until_count_reached() {
        let p = RecurrencePattern::Daily {
            interval: 1,
            end: SeriesEnd::EndAfter { count: 2 },
        };
        assert_eq!(plan_advance(&schedule(p.clone(), jan(1), 0)).unwrap(), Advance::MoveTo(jan(2)));
        assert_eq!(plan_advance(&schedule(p, jan(2), 1)).unwrap(), Advance::Retire);
    }

    #[test]
    fn plan_retires_past_end_date() {
        let p = RecurrencePattern::Daily {
            interval: 7,
            end: SeriesEnd::EndBy { date: jan(10) },
        };
        assert_eq!(plan_advance(&schedule(p.clone(), jan(1), 0)).unwrap(), Advance::MoveTo(jan(8)));
        assert_eq!(plan_advance(&schedule(p, jan(8), 1)).unwrap(), Advance::Retire);
    }

    #[test]
    fn plan_parks_completion_driven() {
        let p = RecurrencePattern::RegenerateAfterCompletion { months_after: 1 };
        assert_eq!(plan_advance(&schedule(p, jan(1), 5)).unwrap(), Advance::AwaitCompletion);
    }

    #[test]
    fn plan_rejects_invalid_pattern_as_permanent() {
        let p = RecurrencePattern::Monthly {
            interval: 1,
            rule: MonthlyRule::DayOfMonth { day: 0 },
            end: SeriesEnd::Never,
        };
        let err = plan_advance(&schedule(p, jan(1), 0)).unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn batch_result_counts() {
        let mut r = BatchResult::default();
        r.absorb(Outcome::Materialized {
            retired: true,
            delivery_failure: None,
        });
        r.absorb(Outcome::Conflict);
        r.absorb(Outcome::Failed(ScheduleFailure {
            schedule_id: "x".into(),
            error: "boom".into(),
            permanent: false,
        }));
        assert_eq!((r.materialized, r.retired, r.conflicts, r.failed), (1, 1, 1, 1));

        let report = ProcessReport::from(r);
        assert_eq!(report.processed_count, 1);
        assert_eq!(report.errors.len(), 1);
    }
}
