// Auto-processing rules: each derives a target series from a source series
pub mod aggregation;
pub mod checks;
pub mod curve;
pub mod registry;

use crate::application::catalog::Catalog;
use crate::application::timeseries_service::TimeseriesStore;
use crate::domain::error::{ExecutionError, ProcessError, RuleId, StoreError};
use crate::domain::station::GroupId;
use crate::domain::time_step::TimeStep;
use crate::domain::timeseries::{flags, Timeseries, TimeseriesData, TimeseriesKey, TimeseriesType};
use aggregation::Aggregation;
use checks::Checks;
use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use curve::CurveInterpolation;

/// Stages an interpolation or aggregation reads from, in order of preference.
const PROCESSED_SOURCE: [TimeseriesType; 2] = [TimeseriesType::Checked, TimeseriesType::Initial];

/// What a processor needs to know about its source beyond the records.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessContext {
    /// Local time of the source group; calendar logic runs in it.
    pub time_zone: FixedOffset,
    pub source_time_step: Option<TimeStep>,
}

impl ProcessContext {
    pub fn new(time_zone: FixedOffset, source_time_step: Option<TimeStep>) -> Self {
        Self {
            time_zone,
            source_time_step,
        }
    }

    pub fn utc() -> Self {
        Self::new(Utc.fix(), None)
    }
}

pub trait Processor {
    fn process(&self, source: &TimeseriesData, ctx: &ProcessContext) -> Result<TimeseriesData, ProcessError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleKind {
    Checks(Checks),
    CurveInterpolation(CurveInterpolation),
    Aggregation(Aggregation),
}

impl RuleKind {
    fn processor(&self) -> &dyn Processor {
        match self {
            RuleKind::Checks(checks) => checks,
            RuleKind::CurveInterpolation(curve) => curve,
            RuleKind::Aggregation(aggregation) => aggregation,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            RuleKind::Checks(_) => "checks",
            RuleKind::CurveInterpolation(_) => "curve_interpolation",
            RuleKind::Aggregation(_) => "aggregation",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The source had nothing past what the target already covers.
    NothingNew,
    Appended(usize),
    /// The last target record was incomplete and got recomputed.
    Replaced(usize),
    /// An expected condition stopped the run; nothing was written.
    Skipped(String),
}

/// Where the target stands before a run.
#[derive(Debug, Clone, Copy, PartialEq)]
struct TargetPosition {
    processed_until: Option<DateTime<Utc>>,
    replace_from: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutoProcess {
    pub id: RuleId,
    pub group_id: GroupId,
    pub kind: RuleKind,
}

impl AutoProcess {
    pub fn new(id: RuleId, group_id: GroupId, kind: RuleKind) -> Self {
        Self { id, group_id, kind }
    }

    /// The source series if it already exists; never creates anything.
    pub fn existing_source(&self, catalog: &Catalog) -> Option<Timeseries> {
        match &self.kind {
            RuleKind::Checks(_) => {
                catalog.find_timeseries(self.group_id, &TimeseriesKey::stage(TimeseriesType::Initial))
            }
            _ => catalog.preferred_timeseries(self.group_id, &PROCESSED_SOURCE),
        }
    }

    pub fn source_timeseries(&self, store: &TimeseriesStore) -> Result<Timeseries, StoreError> {
        if let RuleKind::Checks(_) = self.kind {
            return store.ensure_timeseries(self.group_id, TimeseriesKey::stage(TimeseriesType::Initial));
        }
        match self.existing_source(store.catalog()) {
            Some(timeseries) => Ok(timeseries),
            None => store.ensure_timeseries(self.group_id, TimeseriesKey::stage(TimeseriesType::Initial)),
        }
    }

    pub fn target_timeseries(&self, store: &TimeseriesStore) -> Result<Timeseries, StoreError> {
        match &self.kind {
            RuleKind::Checks(_) => {
                store.ensure_timeseries(self.group_id, TimeseriesKey::stage(TimeseriesType::Checked))
            }
            RuleKind::CurveInterpolation(curve) => store.ensure_timeseries(
                curve.target_group_id,
                TimeseriesKey::stage(TimeseriesType::Initial),
            ),
            RuleKind::Aggregation(aggregation) => store.ensure_timeseries(
                self.group_id,
                TimeseriesKey::aggregated(
                    aggregation.target_time_step,
                    aggregation.method.display_name(),
                ),
            ),
        }
    }

    /// Computes the unprocessed tail of the source and writes it to the target.
    ///
    /// Expected conditions (too little data, unusable steps) are logged and
    /// reported as `Skipped`; anything else fails with the rule identity. A
    /// failed run writes nothing.
    pub async fn execute(&self, store: &TimeseriesStore) -> Result<RunOutcome, ExecutionError> {
        match self.run(store).await {
            Ok(outcome) => {
                tracing::info!(rule_id = self.id, kind = self.kind.name(), ?outcome, "auto process finished");
                Ok(outcome)
            }
            Err(error) if error.is_recoverable() => {
                tracing::warn!(rule_id = self.id, kind = self.kind.name(), %error, "auto process skipped");
                Ok(RunOutcome::Skipped(error.to_string()))
            }
            Err(source) => Err(ExecutionError::Failed {
                rule_id: self.id,
                source,
            }),
        }
    }

    async fn run(&self, store: &TimeseriesStore) -> Result<RunOutcome, ProcessError> {
        let source = self.source_timeseries(store)?;
        let target = self.target_timeseries(store)?;
        let group = store.catalog().group(self.group_id)?;
        let position = self.target_position(store, &target).await?;

        let fetch_start = match position.processed_until {
            Some(t) => Some(
                t.checked_add_signed(self.lookahead_gap())
                    .ok_or(ProcessError::Overflow("source start"))?,
            ),
            None => None,
        };
        tracing::debug!(rule_id = self.id, source = source.id, target = target.id, ?fetch_start, "reading source tail");
        let series = store.get_data(source.id, fetch_start, None, None).await?;
        if series.data.is_empty() {
            return Ok(RunOutcome::NothingNew);
        }
        let input = match (&self.kind, position.processed_until) {
            (RuleKind::Checks(checks), Some(until)) => {
                let mut history = self.checked_history(store, &target, checks, until).await?;
                history.append(series.data);
                history
            }
            _ => series.data,
        };

        let ctx = ProcessContext::new(group.time_zone.offset(), source.time_step);
        let result = self
            .kind
            .processor()
            .process(&input, &ctx)?
            .after(position.processed_until);
        if result.is_empty() {
            return Ok(RunOutcome::NothingNew);
        }

        match position.replace_from {
            Some(from) => Ok(RunOutcome::Replaced(store.replace_tail(target.id, from, result).await?)),
            None => Ok(RunOutcome::Appended(store.append_data(target.id, result, None).await?)),
        }
    }

    /// Offset from the target's last timestamp to the first source record to read.
    fn lookahead_gap(&self) -> Duration {
        let grace = Duration::minutes(1);
        match &self.kind {
            RuleKind::Checks(_) | RuleKind::CurveInterpolation(_) => grace,
            RuleKind::Aggregation(aggregation) => aggregation.offset() + grace,
        }
    }

    /// Already checked records within the rate-of-change window before `until`.
    ///
    /// These come from the target, so points an earlier run flagged TEMPORAL
    /// or nulled stay out of the comparison, as in a single run over everything.
    async fn checked_history(
        &self,
        store: &TimeseriesStore,
        target: &Timeseries,
        checks: &Checks,
        until: DateTime<Utc>,
    ) -> Result<TimeseriesData, ProcessError> {
        let lookback = checks.lookback();
        if lookback <= Duration::zero() {
            return Ok(TimeseriesData::new());
        }
        let start = until
            .checked_sub_signed(lookback)
            .ok_or(ProcessError::Overflow("rate-of-change window"))?;
        Ok(store.get_data(target.id, Some(start), Some(until), None).await?.data)
    }

    async fn target_position(&self, store: &TimeseriesStore, target: &Timeseries) -> Result<TargetPosition, StoreError> {
        let last = store.last_record(target.id).await?;
        match (&self.kind, last) {
            (RuleKind::Aggregation(_), Some(last)) if flags::has_missing(&last.flags) => {
                tracing::debug!(rule_id = self.id, timestamp = %last.timestamp, "recomputing incomplete aggregate");
                let previous = store.record_before(target.id, last.timestamp).await?;
                Ok(TargetPosition {
                    processed_until: previous.map(|r| r.timestamp),
                    replace_from: Some(last.timestamp),
                })
            }
            (_, last) => Ok(TargetPosition {
                processed_until: last.map(|r| r.timestamp),
                replace_from: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::aggregation::AggregationMethod;
    use super::checks::{RangeCheck, RateOfChangeCheck, Threshold};
    use super::*;
    use crate::application::timeseries_service::tests::store;
    use crate::domain::station::DisplayTimezone;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 5, 21, hour, minute, 0).unwrap()
    }

    fn range_rule() -> AutoProcess {
        let checks = Checks::new(Some(RangeCheck::new(0.0, 10.0).unwrap()), None).unwrap();
        AutoProcess::new(1, 1, RuleKind::Checks(checks))
    }

    fn hourly_sum_rule(max_missing: u32) -> AutoProcess {
        let aggregation = Aggregation::new("1h", AggregationMethod::Sum, max_missing, None).unwrap();
        AutoProcess::new(2, 1, RuleKind::Aggregation(aggregation))
    }

    async fn append(store: &TimeseriesStore, id: i64, lines: &str) {
        store
            .append_data(id, lines, Some(&DisplayTimezone::utc()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_checks_process_only_the_new_tail() {
        let store = store();
        let rule = range_rule();
        let source = rule.source_timeseries(&store).unwrap();
        append(&store, source.id, "2019-05-21 10:00,1,\n2019-05-21 10:10,20,\n").await;

        assert_eq!(rule.execute(&store).await.unwrap(), RunOutcome::Appended(2));
        assert_eq!(rule.execute(&store).await.unwrap(), RunOutcome::NothingNew);

        append(&store, source.id, "2019-05-21 10:20,3,\n").await;
        assert_eq!(rule.execute(&store).await.unwrap(), RunOutcome::Appended(1));

        let target = rule.target_timeseries(&store).unwrap();
        let checked = store.get_data(target.id, None, None, None).await.unwrap();
        assert_eq!(checked.data.values(), &[Some(1.0), None, Some(3.0)]);
        assert_eq!(checked.data.flags()[1], "RANGE");
    }

    fn rate_of_change_rule(delta_t: &str) -> AutoProcess {
        let threshold = Threshold {
            delta_t: delta_t.parse().unwrap(),
            allowed_diff: 5.0,
        };
        let checks = Checks::new(None, Some(RateOfChangeCheck::new(vec![threshold], true).unwrap())).unwrap();
        AutoProcess::new(3, 1, RuleKind::Checks(checks))
    }

    async fn checked_data(store: &TimeseriesStore, rule: &AutoProcess) -> TimeseriesData {
        let target = rule.target_timeseries(store).unwrap();
        store.get_data(target.id, None, None, None).await.unwrap().data
    }

    #[tokio::test]
    async fn test_rate_of_change_sees_history() {
        let store = store();
        let rule = rate_of_change_rule("10min");
        let source = rule.source_timeseries(&store).unwrap();

        append(&store, source.id, "2019-05-21 10:00,1,\n").await;
        rule.execute(&store).await.unwrap();
        append(&store, source.id, "2019-05-21 10:10,9,\n").await;
        assert_eq!(rule.execute(&store).await.unwrap(), RunOutcome::Appended(1));

        let target = rule.target_timeseries(&store).unwrap();
        let checked = store.get_data(target.id, None, None, None).await.unwrap();
        assert_eq!(checked.data.values(), &[Some(1.0), None]);
        assert_eq!(checked.data.flags()[1], "TEMPORAL");
    }

    #[tokio::test]
    async fn test_incremental_checks_match_a_single_run() {
        let lines = ["2019-05-21 10:00,1,\n", "2019-05-21 10:10,100,\n", "2019-05-21 10:20,2,\n"];
        let rule = rate_of_change_rule("10min");

        let batch = store();
        let source = rule.source_timeseries(&batch).unwrap();
        append(&batch, source.id, &lines.concat()).await;
        rule.execute(&batch).await.unwrap();
        let expected = checked_data(&batch, &rule).await;
        assert_eq!(expected.values(), &[Some(1.0), None, Some(2.0)]);
        assert_eq!(expected.flags(), &["", "TEMPORAL", ""]);

        // The spike at 10:10 is already flagged, so 10:20 is not compared with it
        let incremental = store();
        let source = rule.source_timeseries(&incremental).unwrap();
        for line in lines {
            append(&incremental, source.id, line).await;
            assert_eq!(rule.execute(&incremental).await.unwrap(), RunOutcome::Appended(1));
        }
        assert_eq!(checked_data(&incremental, &rule).await, expected);
    }

    #[tokio::test]
    async fn test_longest_rate_of_change_window() {
        let store = store();
        let rule = rate_of_change_rule("213744D");
        let source = rule.source_timeseries(&store).unwrap();

        append(&store, source.id, "2019-05-21 10:00,1,\n").await;
        assert_eq!(rule.execute(&store).await.unwrap(), RunOutcome::Appended(1));
        append(&store, source.id, "2019-05-21 10:10,2,\n").await;
        assert_eq!(rule.execute(&store).await.unwrap(), RunOutcome::Appended(1));
        assert_eq!(checked_data(&store, &rule).await.values(), &[Some(1.0), Some(2.0)]);
    }

    #[tokio::test]
    async fn test_aggregation_recomputes_incomplete_last_record() {
        let store = store();
        let rule = hourly_sum_rule(2);
        let source = rule.source_timeseries(&store).unwrap();
        append(
            &store,
            source.id,
            "2019-05-21 10:10,1,\n2019-05-21 10:20,1,\n2019-05-21 10:30,1,\n\
             2019-05-21 10:40,1,\n2019-05-21 10:50,1,\n2019-05-21 11:00,1,\n\
             2019-05-21 11:10,1,\n2019-05-21 11:20,1,\n2019-05-21 11:30,1,\n\
             2019-05-21 11:40,1,\n",
        )
        .await;
        assert_eq!(rule.execute(&store).await.unwrap(), RunOutcome::Appended(2));

        let target = rule.target_timeseries(&store).unwrap();
        assert_eq!(target.name, "Sum");
        let last = store.last_record(target.id).await.unwrap().unwrap();
        assert_eq!((last.timestamp, last.value, last.flags.as_str()), (at(12, 0), Some(4.0), "MISSING2"));

        append(&store, source.id, "2019-05-21 11:50,1,\n2019-05-21 12:00,1,\n").await;
        assert_eq!(rule.execute(&store).await.unwrap(), RunOutcome::Replaced(1));

        let aggregated = store.get_data(target.id, None, None, None).await.unwrap();
        assert_eq!(aggregated.data.timestamps(), &[at(11, 0), at(12, 0)]);
        assert_eq!(aggregated.data.values(), &[Some(6.0), Some(6.0)]);
        assert_eq!(aggregated.data.flags(), &[String::new(), String::new()]);
    }

    #[tokio::test]
    async fn test_aggregation_with_too_few_points_is_skipped() {
        let store = store();
        let rule = hourly_sum_rule(0);
        let source = rule.source_timeseries(&store).unwrap();
        append(&store, source.id, "2019-05-21 10:10,1,\n").await;

        let outcome = rule.execute(&store).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Skipped(_)));
        let target = rule.target_timeseries(&store).unwrap();
        assert!(store.last_record(target.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_aggregation_reads_checked_when_it_exists() {
        let store = store();
        let rule = hourly_sum_rule(0);
        let initial = rule.source_timeseries(&store).unwrap();
        assert_eq!(initial.kind, TimeseriesType::Initial);
        range_rule().target_timeseries(&store).unwrap();
        assert_eq!(rule.source_timeseries(&store).unwrap().kind, TimeseriesType::Checked);
    }

    #[tokio::test]
    async fn test_store_failure_carries_rule_identity() {
        let store = store();
        let curve = CurveInterpolation::new(99, Vec::new()).unwrap();
        let rule = AutoProcess::new(8, 1, RuleKind::CurveInterpolation(curve));
        let err = rule.execute(&store).await.unwrap_err();
        assert_eq!(err.rule_id(), 8);
        assert_eq!(
            err.to_string(),
            "StoreError while executing auto process with id=8: time series group 99 does not exist"
        );
    }
}
