//! `cadence-scheduler`: recurrence engine and scheduled-task materializer.
//!
//! # Overview
//!
//! A [`ScheduleDefinition`] describes a recurring series. On every tick the
//! [`MaterializationPipeline`] asks the [`ScheduleStore`] for schedules whose
//! cursor has arrived, creates one [`TaskInstance`] per schedule, and moves the
//! cursor on with a compare-and-swap so overlapping ticks never materialize
//! the same occurrence twice. The cursor advance and the new instance commit
//! in one transaction (via an outbox table); instances are then handed to the
//! [`TaskSink`].
//!
//! Completion-driven schedules are not advanced by the calendar: the
//! [`CompletionReactor`] re-arms them when their current instance is done.
//!
//! # Pattern variants
//!
//! | Variant                     | Next occurrence                                  |
//! |-----------------------------|--------------------------------------------------|
//! | `Daily`                     | anchor + N days                                  |
//! | `Weekly`                    | next listed weekday, in N-week strides           |
//! | `Monthly` / `DayOfMonth`    | day D, N months on, clamped to month length      |
//! | `Monthly` / `OrdinalWeekday`| first..fourth or last weekday, N months on       |
//! | `Yearly`                    | same month/day, N years on                       |
//! | `RegenerateAfterCompletion` | completion time + M months (reactor only)        |

pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod reactor;
pub mod schedule;
pub mod sink;
pub mod store;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use notify::{ChannelNotifier, Notifier};
pub use pipeline::{BatchResult, MaterializationPipeline, PipelineOptions, ProcessReport, ScheduleFailure};
pub use reactor::{CompletionHook, CompletionOutcome, CompletionReactor};
pub use sink::{SqliteTaskSink, TaskSink};
pub use store::{Advance, CommitOutcome, Materialization, OutboxEntry, ScheduleStore, SqliteScheduleStore};
pub use types::{
    MonthlyRule, NewSchedule, Ordinal, RecurrencePattern, ScheduleDefinition, ScheduleEvent, SeriesEnd,
    TaskInstance, TaskStatus, TaskTemplate,
};
