// Runs auto-process rules off the ingestion path on a bounded worker pool
use crate::application::autoprocess::registry::RuleRegistry;
use crate::application::autoprocess::AutoProcess;
use crate::application::timeseries_service::TimeseriesStore;
use crate::domain::error::{ExecutionError, RuleId};
use crate::domain::timeseries::TimeseriesId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedMutexGuard, Semaphore};
use tokio::task::JoinError;

const IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    /// Waiting for a worker; further requests coalesce into this one.
    Queued,
    /// Executing; `rerun` records a request that arrived meanwhile.
    Running { rerun: bool },
}

struct Inner {
    store: TimeseriesStore,
    registry: Arc<RuleRegistry>,
    workers: Arc<Semaphore>,
    slots: Mutex<HashMap<RuleId, Slot>>,
    target_locks: Mutex<HashMap<TimeseriesId, Arc<tokio::sync::Mutex<()>>>>,
    in_flight: AtomicUsize,
    timeout: Duration,
    failures: mpsc::UnboundedSender<ExecutionError>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Starts draining the store's outbox. Failed executions are delivered on
    /// the returned channel.
    pub fn start(
        store: TimeseriesStore,
        registry: Arc<RuleRegistry>,
        workers: usize,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ExecutionError>) {
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            inner: Arc::new(Inner {
                store,
                registry,
                workers: Arc::new(Semaphore::new(workers.max(1))),
                slots: Mutex::new(HashMap::new()),
                target_locks: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                timeout,
                failures,
            }),
        };

        let inner = dispatcher.inner.clone();
        tokio::spawn(async move {
            loop {
                inner.store.outbox().notified().await;
                inner.drain_outbox();
            }
        });

        (dispatcher, failures_rx)
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.inner.registry
    }

    /// Requests an execution of `rule_id`. Returns once the request is queued.
    pub fn schedule(&self, rule_id: RuleId) -> Result<(), ExecutionError> {
        if self.inner.registry.get(rule_id).is_none() {
            return Err(ExecutionError::UnknownRule(rule_id));
        }
        Inner::schedule(&self.inner, rule_id);
        Ok(())
    }

    pub fn schedule_all(&self) {
        for rule_id in self.inner.registry.ids() {
            Inner::schedule(&self.inner, rule_id);
        }
    }

    /// Registers (or replaces) a rule and runs it once.
    pub fn save_rule(&self, rule: AutoProcess) {
        let rule_id = rule.id;
        self.inner.registry.insert(rule);
        Inner::schedule(&self.inner, rule_id);
    }

    /// Resolves once no trigger is pending and no execution is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            if self.is_idle() {
                tokio::time::sleep(IDLE_POLL).await;
                if self.is_idle() {
                    return;
                }
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    fn is_idle(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst) == 0 && self.inner.store.outbox().is_empty()
    }
}

impl Inner {
    fn drain_outbox(self: &Arc<Self>) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let mut scheduled = Vec::new();
        for timeseries_id in self.store.outbox().drain() {
            for rule_id in self.registry.affected_by(timeseries_id, self.store.catalog()) {
                if !scheduled.contains(&rule_id) {
                    tracing::debug!(rule_id, timeseries_id, "source extended, scheduling");
                    scheduled.push(rule_id);
                }
            }
        }
        for rule_id in scheduled {
            Self::schedule(self, rule_id);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn schedule(self: &Arc<Self>, rule_id: RuleId) {
        {
            let mut slots = self.slots.lock();
            match slots.get_mut(&rule_id) {
                Some(Slot::Queued) => {
                    tracing::debug!(rule_id, "execution already queued, coalescing");
                    return;
                }
                Some(Slot::Running { rerun }) => {
                    tracing::debug!(rule_id, "execution running, rerun requested");
                    *rerun = true;
                    return;
                }
                None => {
                    slots.insert(rule_id, Slot::Queued);
                }
            }
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let worker = Worker {
            inner: self.clone(),
            rule_id,
            released: false,
        };
        tokio::spawn(worker.run());
    }

    async fn run_once(&self, rule_id: RuleId) {
        let Some(rule) = self.registry.get(rule_id) else {
            tracing::debug!(rule_id, "rule removed before it ran");
            return;
        };
        let _guard = self.lock_target(&rule).await;
        let store = self.store.clone();
        let mut execution = tokio::spawn(async move { rule.execute(&store).await });
        let result = match tokio::time::timeout(self.timeout, &mut execution).await {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => Err(ExecutionError::Panicked {
                rule_id,
                message: panic_message(error),
            }),
            Err(_) => {
                execution.abort();
                // Keep the target locked until the aborted run has stopped
                let _ = (&mut execution).await;
                Err(ExecutionError::TimedOut {
                    rule_id,
                    timeout: self.timeout,
                })
            }
        };
        if let Err(error) = result {
            if self.failures.send(error).is_err() {
                tracing::warn!(rule_id, "failure channel closed, dropping execution error");
            }
        }
    }

    /// Serializes executions that write the same target series. A target that
    /// cannot be resolved is left to `execute` to report.
    async fn lock_target(&self, rule: &AutoProcess) -> Option<OwnedMutexGuard<()>> {
        let target = rule.target_timeseries(&self.store).ok()?;
        let lock = self.target_locks.lock().entry(target.id).or_default().clone();
        Some(lock.lock_owned().await)
    }
}

/// One queued request for a rule. Dropping it gives back the in-flight count
/// and, unless the loop already did, the rule's slot.
struct Worker {
    inner: Arc<Inner>,
    rule_id: RuleId,
    released: bool,
}

impl Worker {
    async fn run(mut self) {
        let inner = self.inner.clone();
        let rule_id = self.rule_id;
        let Ok(_permit) = inner.workers.clone().acquire_owned().await else {
            return;
        };
        inner.slots.lock().insert(rule_id, Slot::Running { rerun: false });
        loop {
            inner.run_once(rule_id).await;
            let mut slots = inner.slots.lock();
            match slots.get_mut(&rule_id) {
                Some(Slot::Running { rerun }) if *rerun => *rerun = false,
                _ => {
                    // Under the same lock as the rerun check, so no request is lost
                    slots.remove(&rule_id);
                    self.released = true;
                    return;
                }
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !self.released {
            self.inner.slots.lock().remove(&self.rule_id);
        }
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn panic_message(error: JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string()),
        Err(error) => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::autoprocess::aggregation::{Aggregation, AggregationMethod};
    use crate::application::autoprocess::checks::{Checks, RangeCheck};
    use crate::application::autoprocess::curve::CurveInterpolation;
    use crate::application::autoprocess::RuleKind;
    use crate::application::catalog::tests::catalog_with_group;
    use crate::application::outbox::TriggerOutbox;
    use crate::application::record_store::RecordStore;
    use crate::application::timeseries_service::tests::store;
    use crate::domain::error::StoreError;
    use crate::domain::station::DisplayTimezone;
    use crate::domain::timeseries::{TimeseriesData, TimeseriesRecord};
    use crate::infrastructure::memory_store::MemoryRecordStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    const TEN_MINUTE_SERIES: &str = "2019-05-21 10:10,1,\n2019-05-21 10:20,1,\n2019-05-21 10:30,1,\n\
                                     2019-05-21 10:40,1,\n2019-05-21 10:50,1,\n2019-05-21 11:00,1,\n\
                                     2019-05-21 11:10,50,\n";

    fn checks_rule() -> AutoProcess {
        let checks = Checks::new(Some(RangeCheck::new(0.0, 10.0).unwrap()), None).unwrap();
        AutoProcess::new(1, 1, RuleKind::Checks(checks))
    }

    fn hourly_sum_rule() -> AutoProcess {
        let aggregation = Aggregation::new("1h", AggregationMethod::Sum, 6, None).unwrap();
        AutoProcess::new(2, 1, RuleKind::Aggregation(aggregation))
    }

    fn start(store: TimeseriesStore, timeout: Duration) -> (Dispatcher, mpsc::UnboundedReceiver<ExecutionError>) {
        Dispatcher::start(store, Arc::new(RuleRegistry::new()), 2, timeout)
    }

    #[tokio::test]
    async fn test_append_runs_downstream_chain() {
        let store = store();
        let (dispatcher, mut failures) = start(store.clone(), Duration::from_secs(10));
        let checks = checks_rule();
        let aggregation = hourly_sum_rule();
        let initial = checks.source_timeseries(&store).unwrap();
        let checked = checks.target_timeseries(&store).unwrap();
        dispatcher.registry().insert(checks);
        dispatcher.registry().insert(aggregation.clone());

        store
            .append_data(initial.id, TEN_MINUTE_SERIES, Some(&DisplayTimezone::utc()))
            .await
            .unwrap();
        dispatcher.wait_idle().await;

        let checked = store.get_data(checked.id, None, None, None).await.unwrap();
        assert_eq!(checked.data.len(), 7);
        assert_eq!(checked.data.flags()[6], "RANGE");

        let target = aggregation.target_timeseries(&store).unwrap();
        let aggregated = store.get_data(target.id, None, None, None).await.unwrap();
        // The 12:00 bucket holds only the nulled spike and is trimmed
        assert_eq!(aggregated.data.values(), &[Some(6.0)]);
        assert!(failures.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_repeated_requests_never_overlap() {
        let store = store();
        let (dispatcher, mut failures) = start(store.clone(), Duration::from_secs(10));
        let rule = checks_rule();
        let initial = rule.source_timeseries(&store).unwrap();
        let target = rule.target_timeseries(&store).unwrap();
        dispatcher.registry().insert(rule);

        store
            .append_data(initial.id, TEN_MINUTE_SERIES, Some(&DisplayTimezone::utc()))
            .await
            .unwrap();
        for _ in 0..20 {
            dispatcher.schedule(1).unwrap();
        }
        dispatcher.wait_idle().await;

        // Overlapping runs would race on the same tail and fail out of order
        assert!(failures.try_recv().is_err());
        assert_eq!(store.get_data(target.id, None, None, None).await.unwrap().data.len(), 7);
    }

    #[tokio::test]
    async fn test_unknown_rule_is_rejected() {
        let (dispatcher, _failures) = start(store(), Duration::from_secs(10));
        assert!(matches!(dispatcher.schedule(42), Err(ExecutionError::UnknownRule(42))));
    }

    #[tokio::test]
    async fn test_failures_reach_the_channel() {
        let (dispatcher, mut failures) = start(store(), Duration::from_secs(10));
        let curve = CurveInterpolation::new(99, Vec::new()).unwrap();
        dispatcher.save_rule(AutoProcess::new(5, 1, RuleKind::CurveInterpolation(curve)));
        dispatcher.wait_idle().await;

        let error = failures.recv().await.unwrap();
        assert_eq!(error.rule_id(), 5);
        assert!(matches!(error, ExecutionError::Failed { .. }));
    }

    struct SlowRecordStore(MemoryRecordStore);

    #[async_trait]
    impl RecordStore for SlowRecordStore {
        async fn read_range(
            &self,
            timeseries_id: TimeseriesId,
            start: Option<DateTime<Utc>>,
            end: Option<DateTime<Utc>>,
        ) -> Result<TimeseriesData, StoreError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            self.0.read_range(timeseries_id, start, end).await
        }

        async fn bulk_append(&self, timeseries_id: TimeseriesId, records: &TimeseriesData) -> Result<usize, StoreError> {
            self.0.bulk_append(timeseries_id, records).await
        }

        async fn latest(&self, timeseries_id: TimeseriesId) -> Result<Option<TimeseriesRecord>, StoreError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            self.0.latest(timeseries_id).await
        }

        async fn earliest(&self, timeseries_id: TimeseriesId) -> Result<Option<TimeseriesRecord>, StoreError> {
            self.0.earliest(timeseries_id).await
        }

        async fn delete_range(
            &self,
            timeseries_id: TimeseriesId,
            start: Option<DateTime<Utc>>,
            end: Option<DateTime<Utc>>,
        ) -> Result<usize, StoreError> {
            self.0.delete_range(timeseries_id, start, end).await
        }

        async fn replace_from(
            &self,
            timeseries_id: TimeseriesId,
            from: Option<DateTime<Utc>>,
            records: &TimeseriesData,
        ) -> Result<usize, StoreError> {
            self.0.replace_from(timeseries_id, from, records).await
        }
    }

    struct PanickingRecordStore;

    #[async_trait]
    impl RecordStore for PanickingRecordStore {
        async fn read_range(
            &self,
            _timeseries_id: TimeseriesId,
            _start: Option<DateTime<Utc>>,
            _end: Option<DateTime<Utc>>,
        ) -> Result<TimeseriesData, StoreError> {
            panic!("record store unavailable")
        }

        async fn bulk_append(&self, _timeseries_id: TimeseriesId, _records: &TimeseriesData) -> Result<usize, StoreError> {
            panic!("record store unavailable")
        }

        async fn latest(&self, _timeseries_id: TimeseriesId) -> Result<Option<TimeseriesRecord>, StoreError> {
            panic!("record store unavailable")
        }

        async fn earliest(&self, _timeseries_id: TimeseriesId) -> Result<Option<TimeseriesRecord>, StoreError> {
            panic!("record store unavailable")
        }

        async fn delete_range(
            &self,
            _timeseries_id: TimeseriesId,
            _start: Option<DateTime<Utc>>,
            _end: Option<DateTime<Utc>>,
        ) -> Result<usize, StoreError> {
            panic!("record store unavailable")
        }

        async fn replace_from(
            &self,
            _timeseries_id: TimeseriesId,
            _from: Option<DateTime<Utc>>,
            _records: &TimeseriesData,
        ) -> Result<usize, StoreError> {
            panic!("record store unavailable")
        }
    }

    #[tokio::test]
    async fn test_panicking_execution_is_reported_and_released() {
        let store = TimeseriesStore::new(
            Arc::new(PanickingRecordStore),
            Arc::new(catalog_with_group()),
            Arc::new(TriggerOutbox::new()),
        );
        let (dispatcher, mut failures) = start(store, Duration::from_secs(10));
        dispatcher.save_rule(checks_rule());
        tokio::time::timeout(Duration::from_secs(2), dispatcher.wait_idle())
            .await
            .unwrap();

        let error = failures.recv().await.unwrap();
        assert!(matches!(error, ExecutionError::Panicked { rule_id: 1, .. }));
        assert_eq!(
            error.to_string(),
            "auto process with id=1 panicked: record store unavailable"
        );

        // The slot was freed, so the rule runs again instead of coalescing forever
        dispatcher.schedule(1).unwrap();
        tokio::time::timeout(Duration::from_secs(2), dispatcher.wait_idle())
            .await
            .unwrap();
        assert!(matches!(
            failures.recv().await,
            Some(ExecutionError::Panicked { rule_id: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_slow_execution_times_out() {
        let store = TimeseriesStore::new(
            Arc::new(SlowRecordStore(MemoryRecordStore::new())),
            Arc::new(catalog_with_group()),
            Arc::new(TriggerOutbox::new()),
        );
        let (dispatcher, mut failures) = start(store.clone(), Duration::from_millis(50));
        let rule = checks_rule();
        let target = rule.target_timeseries(&store).unwrap();
        dispatcher.save_rule(rule);
        dispatcher.wait_idle().await;

        let error = failures.recv().await.unwrap();
        assert!(matches!(error, ExecutionError::TimedOut { rule_id: 1, .. }));
        assert!(store.last_record(target.id).await.unwrap().is_none());
    }
}
