use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_BATCH_BUDGET_SECS: u64 = 30; // 0 disables the budget
pub const DEFAULT_SCHEDULE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
pub const DEFAULT_OUTBOX_BATCH: usize = 100;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Materialization pipeline and engine loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two engine ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Wall-clock budget for one tick. After it expires the tick returns
    /// partial results. Set to 0 to run every due schedule to completion.
    #[serde(default = "default_batch_budget")]
    pub batch_budget_secs: u64,
    /// Upper bound on the time spent materializing a single schedule.
    #[serde(default = "default_schedule_timeout")]
    pub schedule_timeout_secs: u64,
    /// How many schedules are processed concurrently within one tick.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Maximum undelivered outbox rows replayed at the start of a tick.
    #[serde(default = "default_outbox_batch")]
    pub outbox_batch: usize,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn batch_budget(&self) -> Option<Duration> {
        (self.batch_budget_secs > 0).then(|| Duration::from_secs(self.batch_budget_secs))
    }

    pub fn schedule_timeout(&self) -> Duration {
        Duration::from_secs(self.schedule_timeout_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            batch_budget_secs: DEFAULT_BATCH_BUDGET_SECS,
            schedule_timeout_secs: DEFAULT_SCHEDULE_TIMEOUT_SECS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            outbox_batch: DEFAULT_OUTBOX_BATCH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Capacity of the bounded event channel; events are dropped when full.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_batch_budget() -> u64 {
    DEFAULT_BATCH_BUDGET_SECS
}
fn default_schedule_timeout() -> u64 {
    DEFAULT_SCHEDULE_TIMEOUT_SECS
}
fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}
fn default_outbox_batch() -> usize {
    DEFAULT_OUTBOX_BATCH
}
fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Self::figment()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))?;

        tracing::debug!(%path, "configuration loaded");
        Ok(config)
    }

    /// Base figment seeded with the built-in defaults.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(CadenceConfig::default()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
