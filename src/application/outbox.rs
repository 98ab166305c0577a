// Pending "series extended" triggers, recorded after a write commits
use crate::domain::timeseries::TimeseriesId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct TriggerOutbox {
    pending: Mutex<VecDeque<TimeseriesId>>,
    notify: Notify,
}

impl TriggerOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, timeseries_id: TimeseriesId) {
        {
            let mut pending = self.pending.lock();
            if !pending.contains(&timeseries_id) {
                pending.push_back(timeseries_id);
            }
        }
        tracing::debug!(timeseries_id, "series extended");
        self.notify.notify_one();
    }

    /// Takes every pending trigger, oldest first.
    pub fn drain(&self) -> Vec<TimeseriesId> {
        self.pending.lock().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Resolves once something was pushed since the last wakeup.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}
