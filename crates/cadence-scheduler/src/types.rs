use chrono::{DateTime, FixedOffset, SecondsFormat, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Defines how a series recurs.
///
/// Calendar-driven variants carry a [`SeriesEnd`]; the completion-driven
/// variant does not, since only the completion of its current instance can
/// move it forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecurrencePattern {
    /// Every `interval` days.
    Daily {
        interval: u32,
        #[serde(default)]
        end: SeriesEnd,
    },

    /// On the listed weekdays, every `interval` weeks (weeks start on Monday).
    Weekly {
        interval: u32,
        weekdays: Vec<Weekday>,
        #[serde(default)]
        end: SeriesEnd,
    },

    /// Every `interval` months, on the day selected by `rule`.
    Monthly {
        interval: u32,
        rule: MonthlyRule,
        #[serde(default)]
        end: SeriesEnd,
    },

    /// Every `interval` years on the anchor's month and day.
    Yearly {
        interval: u32,
        #[serde(default)]
        end: SeriesEnd,
    },

    /// Re-armed `months_after` months after the current instance is completed.
    RegenerateAfterCompletion { months_after: u32 },
}

/// Day selection for [`RecurrencePattern::Monthly`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum MonthlyRule {
    /// Fixed day of month, clamped to the target month's length.
    DayOfMonth { day: u32 },
    /// e.g. "second Tuesday", "last Friday".
    OrdinalWeekday { ordinal: Ordinal, weekday: Weekday },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ordinal {
    First,
    Second,
    Third,
    Fourth,
    Last,
}

impl Ordinal {
    /// Zero-based week index within the month; `None` for `Last`.
    pub fn week_index(self) -> Option<u32> {
        match self {
            Ordinal::First => Some(0),
            Ordinal::Second => Some(1),
            Ordinal::Third => Some(2),
            Ordinal::Fourth => Some(3),
            Ordinal::Last => None,
        }
    }
}

/// When a calendar-driven series stops producing occurrences.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SeriesEnd {
    #[default]
    Never,
    /// No occurrence strictly after `date`.
    EndBy { date: DateTime<Utc> },
    /// Retire once `count` instances have been materialized.
    EndAfter { count: u32 },
}

impl RecurrencePattern {
    /// The series-end policy, or `None` for completion-driven patterns.
    pub fn series_end(&self) -> Option<&SeriesEnd> {
        match self {
            RecurrencePattern::Daily { end, .. }
            | RecurrencePattern::Weekly { end, .. }
            | RecurrencePattern::Monthly { end, .. }
            | RecurrencePattern::Yearly { end, .. } => Some(end),
            RecurrencePattern::RegenerateAfterCompletion { .. } => None,
        }
    }

    pub fn is_completion_driven(&self) -> bool {
        matches!(self, RecurrencePattern::RegenerateAfterCompletion { .. })
    }

    /// Reject field values the calculator cannot make progress with.
    pub fn validate(&self) -> Result<()> {
        let interval = match self {
            RecurrencePattern::Daily { interval, .. }
            | RecurrencePattern::Weekly { interval, .. }
            | RecurrencePattern::Monthly { interval, .. }
            | RecurrencePattern::Yearly { interval, .. } => *interval,
            RecurrencePattern::RegenerateAfterCompletion { months_after } => {
                if *months_after == 0 {
                    return Err(SchedulerError::InvalidPattern(
                        "months_after must be at least 1".into(),
                    ));
                }
                return Ok(());
            }
        };
        if interval == 0 {
            return Err(SchedulerError::InvalidPattern(
                "interval must be at least 1".into(),
            ));
        }

        match self {
            RecurrencePattern::Weekly { weekdays, .. } if weekdays.is_empty() => {
                return Err(SchedulerError::InvalidPattern(
                    "weekly pattern needs at least one weekday".into(),
                ));
            }
            RecurrencePattern::Monthly {
                rule: MonthlyRule::DayOfMonth { day },
                ..
            } if !(1..=31).contains(day) => {
                return Err(SchedulerError::InvalidPattern(format!(
                    "day of month out of range: {day}"
                )));
            }
            _ => {}
        }

        if let Some(SeriesEnd::EndAfter { count: 0 }) = self.series_end() {
            return Err(SchedulerError::InvalidPattern(
                "end_after count must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Fields copied verbatim onto every materialized instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
    /// Owning group / household / team identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Effort or weight class, opaque to the scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
}

/// A persisted recurring series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    /// UUID v7 string, primary key.
    pub id: String,
    pub template: TaskTemplate,
    pub pattern: RecurrencePattern,
    /// Fixed offset (minutes east of UTC) in which calendar fields are evaluated.
    pub utc_offset_minutes: i32,
    /// Next occurrence to materialize. Never decreases while active.
    pub cursor: DateTime<Utc>,
    /// Instances materialized so far.
    pub occurrence_count: u32,
    /// False once the series is retired; retirement is permanent.
    pub active: bool,
    /// Operator pause. Paused schedules are skipped but keep their cursor.
    pub paused: bool,
    /// Completion-driven schedules wait here between materialization and completion.
    pub awaiting_completion: bool,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleDefinition {
    /// The offset all calendar arithmetic for this schedule runs in.
    pub fn offset(&self) -> Result<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                SchedulerError::InvalidSchedule(format!(
                    "utc offset out of range: {} minutes",
                    self.utc_offset_minutes
                ))
            })
    }
}

/// Input for creating a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub template: TaskTemplate,
    pub pattern: RecurrencePattern,
    /// First eligible instant; the initial cursor is derived from it.
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

/// Lifecycle state of a materialized task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Complete,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Complete => "complete",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "active" => Ok(TaskStatus::Active),
            "complete" => Ok(TaskStatus::Complete),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// One concrete occurrence of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    /// Assigned by the task sink; `None` until delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// `{schedule_id}@{occurrence}`; identical for every retry of the same occurrence.
    pub idempotency_key: String,
    pub parent_schedule_id: String,
    pub occurrence_date: DateTime<Utc>,
    pub status: TaskStatus,
    pub template: TaskTemplate,
}

impl TaskInstance {
    /// Build the pending instance for the schedule's current cursor.
    pub fn materialize(schedule: &ScheduleDefinition) -> Self {
        Self {
            id: None,
            idempotency_key: format!(
                "{}@{}",
                schedule.id,
                schedule.cursor.to_rfc3339_opts(SecondsFormat::Millis, true)
            ),
            parent_schedule_id: schedule.id.clone(),
            occurrence_date: schedule.cursor,
            status: TaskStatus::Pending,
            template: schedule.template.clone(),
        }
    }
}

/// Emitted to the notifier after a schedule has been processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScheduleEvent {
    Materialized {
        schedule_id: String,
        instance_id: Option<String>,
        occurrence_date: DateTime<Utc>,
        title: String,
        assignees: Vec<String>,
    },
    Retired {
        schedule_id: String,
        occurrence_count: u32,
    },
}
