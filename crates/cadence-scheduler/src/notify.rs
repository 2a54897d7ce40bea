use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::{Result, SchedulerError},
    types::ScheduleEvent,
};

/// Fire-and-forget event sink. The pipeline logs and discards any error.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &ScheduleEvent) -> Result<()>;
}

/// Forwards events into a bounded mpsc channel for a delivery task to route.
///
/// Uses `try_send`, so a slow consumer never stalls a tick; a full channel
/// surfaces as an error the pipeline swallows.
pub struct ChannelNotifier {
    tx: mpsc::Sender<ScheduleEvent>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<ScheduleEvent>) -> Self {
        Self { tx }
    }

    /// Convenience: build the notifier together with its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ScheduleEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: &ScheduleEvent) -> Result<()> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SchedulerError::Notify("event channel full".into()),
            mpsc::error::TrySendError::Closed(_) => {
                SchedulerError::Notify("event channel closed".into())
            }
        })
    }
}
