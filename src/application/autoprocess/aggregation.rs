// Regularization and aggregation to a coarser time step
use super::{ProcessContext, Processor};
use crate::domain::error::{ProcessError, ValidationError};
use crate::domain::time_step::{TimeStep, TimestampOffset};
use crate::domain::timeseries::{flags, TimeseriesData};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

/// Points needed before a time step can be inferred from the spacing.
const MIN_POINTS_FOR_INFERENCE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    Sum,
    Mean,
    Max,
    Min,
}

impl AggregationMethod {
    /// Also the name of the aggregated time series.
    pub fn display_name(self) -> &'static str {
        match self {
            AggregationMethod::Sum => "Sum",
            AggregationMethod::Mean => "Mean",
            AggregationMethod::Max => "Max",
            AggregationMethod::Min => "Min",
        }
    }

    fn apply(self, values: &[f64]) -> f64 {
        match self {
            AggregationMethod::Sum => values.iter().sum(),
            AggregationMethod::Mean => values.iter().sum::<f64>() / values.len() as f64,
            AggregationMethod::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AggregationMethod::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        }
    }
}

impl FromStr for AggregationMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(AggregationMethod::Sum),
            "mean" => Ok(AggregationMethod::Mean),
            "max" => Ok(AggregationMethod::Max),
            "min" => Ok(AggregationMethod::Min),
            _ => Err(ValidationError::UnknownMethod(s.to_string())),
        }
    }
}

/// How a source point is picked for each slot of the regular grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegularizationMode {
    /// The nearest sample within half a step.
    Instantaneous,
    /// A sample exactly on the slot, or the only sample near it.
    Interval,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub target_time_step: TimeStep,
    pub method: AggregationMethod,
    pub max_missing: u32,
    pub resulting_timestamp_offset: Option<TimestampOffset>,
}

impl Aggregation {
    pub fn new(
        target_time_step: &str,
        method: AggregationMethod,
        max_missing: u32,
        resulting_timestamp_offset: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let resulting_timestamp_offset = match resulting_timestamp_offset {
            None | Some("") => None,
            Some(offset) => Some(offset.parse()?),
        };
        Ok(Self {
            target_time_step: target_time_step.parse()?,
            method,
            max_missing,
            resulting_timestamp_offset,
        })
    }

    pub fn regularization_mode(&self) -> RegularizationMode {
        match self.method {
            AggregationMethod::Mean => RegularizationMode::Instantaneous,
            _ => RegularizationMode::Interval,
        }
    }

    pub fn offset(&self) -> Duration {
        self.resulting_timestamp_offset
            .map_or_else(Duration::zero, |o| o.duration())
    }

    /// Source step in seconds: the declared one, else the most common spacing.
    fn source_step(&self, local: &[i64], ctx: &ProcessContext) -> Result<i64, ProcessError> {
        let step = match ctx.source_time_step {
            Some(step) => step
                .fixed_duration()
                .map(|d| d.num_seconds())
                .ok_or(ProcessError::UnsupportedSourceStep)?,
            None => infer_step(local)?,
        };
        if step <= 0 || step % 60 != 0 {
            return Err(ProcessError::UnsupportedSourceStep);
        }
        Ok(step)
    }

    fn regularize(&self, local: &[i64], values: &[Option<f64>], step: i64) -> Vec<(i64, Option<f64>)> {
        let (Some(&first), Some(&last)) = (local.first(), local.last()) else {
            return Vec::new();
        };
        let half = step / 2;
        let slot_of = |t: i64| (t + half).div_euclid(step) * step;
        let mode = self.regularization_mode();

        let mut grid = Vec::new();
        let mut cursor = 0;
        let mut slot = slot_of(first);
        while slot <= slot_of(last) {
            let (low, high) = (slot - half, slot - half + step);
            while cursor < local.len() && local[cursor] < low {
                cursor += 1;
            }
            let mut end = cursor;
            while end < local.len() && local[end] < high {
                end += 1;
            }
            let value = match mode {
                RegularizationMode::Instantaneous => (cursor..end)
                    .min_by_key(|&i| (local[i] - slot).abs())
                    .and_then(|i| values[i]),
                RegularizationMode::Interval => match (cursor..end).find(|&i| local[i] == slot) {
                    Some(exact) => values[exact],
                    None if end - cursor == 1 => values[cursor],
                    None => None,
                },
            };
            grid.push((slot, value));
            slot += step;
        }
        grid
    }

    /// The `(start, end]` bucket of the target step containing local time `t`.
    fn bucket(&self, t: i64) -> Result<(i64, i64), ProcessError> {
        if let Some(length) = self.target_time_step.fixed_duration() {
            let length = length.num_seconds();
            let end = -(-t).div_euclid(length) * length;
            return Ok((end - length, end));
        }
        let months = self.target_time_step.months().unwrap_or(1);
        let local = DateTime::<Utc>::from_timestamp(t, 0)
            .ok_or(ProcessError::Overflow("bucket boundaries"))?
            .naive_utc();
        let index = i64::from(local.year()) * 12 + i64::from(local.month0());
        let on_boundary = local.day() == 1 && local.num_seconds_from_midnight() == 0;
        let end_index = if on_boundary && index.rem_euclid(months) == 0 {
            index
        } else {
            (index.div_euclid(months) + 1) * months
        };
        let start = month_start(end_index - months)?;
        let end = month_start(end_index)?;
        Ok((start, end))
    }
}

impl Processor for Aggregation {
    fn process(&self, source: &TimeseriesData, ctx: &ProcessContext) -> Result<TimeseriesData, ProcessError> {
        if source.is_empty() {
            return Ok(TimeseriesData::new());
        }
        let tz_seconds = i64::from(ctx.time_zone.local_minus_utc());
        let local: Vec<i64> = source
            .timestamps()
            .iter()
            .map(|t| t.timestamp() + tz_seconds)
            .collect();
        let step = self.source_step(&local, ctx)?;
        let grid = self.regularize(&local, source.values(), step);

        let min_present = |expected: i64| (expected - i64::from(self.max_missing)).max(1);
        let mut buckets: Vec<(i64, Option<f64>, String)> = Vec::new();
        let mut i = 0;
        while i < grid.len() {
            let (start, end) = self.bucket(grid[i].0)?;
            if (end - start) % step != 0 {
                return Err(ProcessError::IncompatibleSteps {
                    source_step: format!("{}min", step / 60),
                    target: self.target_time_step.to_string(),
                });
            }
            let expected = (end - start) / step;
            let mut present = Vec::new();
            while i < grid.len() && grid[i].0 <= end {
                present.extend(grid[i].1);
                i += 1;
            }
            let missing = expected - present.len() as i64;
            if present.len() as i64 >= min_present(expected) {
                let value = self.method.apply(&present);
                if !value.is_finite() {
                    return Err(ProcessError::Overflow("aggregated value"));
                }
                let record_flags = if missing > 0 {
                    flags::missing(missing as usize)
                } else {
                    String::new()
                };
                buckets.push((end, Some(value), record_flags));
            } else {
                buckets.push((end, None, String::new()));
            }
        }

        let first = buckets.iter().position(|b| b.1.is_some());
        let last = buckets.iter().rposition(|b| b.1.is_some());
        let mut result = TimeseriesData::new();
        let (Some(first), Some(last)) = (first, last) else {
            return Ok(result);
        };
        let shift = tz_seconds + self.offset().num_seconds();
        for (end, value, record_flags) in buckets.drain(first..=last) {
            let timestamp = DateTime::<Utc>::from_timestamp(end - shift, 0)
                .ok_or(ProcessError::Overflow("resulting timestamp"))?;
            result.push(timestamp, value, record_flags);
        }
        Ok(result)
    }
}

fn infer_step(local: &[i64]) -> Result<i64, ProcessError> {
    if local.len() < MIN_POINTS_FOR_INFERENCE {
        return Err(ProcessError::InsufficientData {
            needed: MIN_POINTS_FOR_INFERENCE,
            got: local.len(),
        });
    }
    let mut spacing: HashMap<i64, usize> = HashMap::new();
    for pair in local.windows(2) {
        *spacing.entry(pair[1] - pair[0]).or_default() += 1;
    }
    spacing
        .into_iter()
        .max_by_key(|&(diff, count)| (count, std::cmp::Reverse(diff)))
        .map(|(diff, _)| diff)
        .ok_or(ProcessError::UnsupportedSourceStep)
}

/// Seconds of 00:00 on the first day of month number `index` (year * 12 + month0).
fn month_start(index: i64) -> Result<i64, ProcessError> {
    let overflow = || ProcessError::Overflow("month boundaries");
    let year = i32::try_from(index.div_euclid(12)).map_err(|_| overflow())?;
    let month = index.rem_euclid(12) as u32 + 1;
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt: NaiveDateTime| dt.and_utc().timestamp())
        .ok_or_else(overflow)
}
