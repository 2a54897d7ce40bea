use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::pipeline::MaterializationPipeline;

/// Periodic trigger: calls [`MaterializationPipeline::process_due_schedules`]
/// every `interval` until shut down.
pub struct SchedulerEngine {
    pipeline: Arc<MaterializationPipeline>,
    interval: Duration,
}

impl SchedulerEngine {
    pub fn new(pipeline: Arc<MaterializationPipeline>, interval: Duration) -> Self {
        Self { pipeline, interval }
    }

    /// Main event loop. Ticks immediately, then every `interval`, until
    /// `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "scheduler engine started");

        let mut interval = tokio::time::interval(self.interval);
        // A slow tick must not be followed by a burst of catch-up ticks.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        match self.pipeline.process_due_schedules().await {
            Ok(report) if report.errors.is_empty() => {
                if report.processed_count > 0 {
                    info!(processed = report.processed_count, "tick finished");
                }
            }
            Ok(report) => warn!(
                processed = report.processed_count,
                errors = report.errors.len(),
                "tick finished with per-schedule errors"
            ),
            // Store unreachable: nothing advanced, the next tick retries everything.
            Err(e) => error!("scheduler tick error: {e}"),
        }
    }
}
