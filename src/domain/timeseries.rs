// Time series domain models
use super::station::GroupId;
use super::time_step::TimeStep;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TimeseriesId = i64;

/// Processing stage of a time series within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeseriesType {
    Initial,
    Checked,
    Regularized,
    Aggregated,
}

impl TimeseriesType {
    /// Stages other than `Aggregated` may exist at most once per group.
    pub fn is_unique_per_group(self) -> bool {
        !matches!(self, TimeseriesType::Aggregated)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            TimeseriesType::Initial => "Initial",
            TimeseriesType::Checked => "Checked",
            TimeseriesType::Regularized => "Regularized",
            TimeseriesType::Aggregated => "Aggregated",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timeseries {
    pub id: TimeseriesId,
    pub group_id: GroupId,
    pub kind: TimeseriesType,
    pub time_step: Option<TimeStep>,
    pub name: String,
    pub publicly_available: bool,
}

impl Timeseries {
    pub fn label(&self) -> String {
        match (&self.kind, &self.time_step) {
            (TimeseriesType::Aggregated, Some(step)) => {
                format!("{} ({})", self.kind.display_name(), step)
            }
            _ => self.kind.display_name().to_string(),
        }
    }
}

/// Identity of a time series within its group, as used by get-or-create.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeseriesKey {
    pub kind: TimeseriesType,
    pub time_step: Option<TimeStep>,
    pub name: String,
}

impl TimeseriesKey {
    pub fn stage(kind: TimeseriesType) -> Self {
        Self {
            kind,
            time_step: None,
            name: String::new(),
        }
    }

    pub fn aggregated(time_step: TimeStep, name: impl Into<String>) -> Self {
        Self {
            kind: TimeseriesType::Aggregated,
            time_step: Some(time_step),
            name: name.into(),
        }
    }

    pub fn matches(&self, timeseries: &Timeseries) -> bool {
        if timeseries.kind != self.kind {
            return false;
        }
        if self.kind.is_unique_per_group() {
            return true;
        }
        timeseries.time_step == self.time_step && timeseries.name == self.name
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeseriesRecord {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
    pub flags: String,
}

impl TimeseriesRecord {
    pub fn new(timestamp: DateTime<Utc>, value: Option<f64>, flags: impl Into<String>) -> Self {
        Self {
            timestamp,
            value,
            flags: flags.into(),
        }
    }
}

/// Columnar, timestamp-ordered record set of one time series (UTC).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeseriesData {
    timestamps: Vec<DateTime<Utc>>,
    values: Vec<Option<f64>>,
    flags: Vec<String>,
}

impl TimeseriesData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            timestamps: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            flags: Vec::with_capacity(capacity),
        }
    }

    pub fn from_records(records: impl IntoIterator<Item = TimeseriesRecord>) -> Self {
        let mut data = Self::new();
        for record in records {
            data.push(record.timestamp, record.value, record.flags);
        }
        data
    }

    pub fn push(&mut self, timestamp: DateTime<Utc>, value: Option<f64>, flags: impl Into<String>) {
        self.timestamps.push(timestamp);
        // NaN is how upstream producers usually spell "missing"
        self.values.push(value.filter(|v| !v.is_nan()));
        self.flags.push(flags.into());
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [Option<f64>] {
        &mut self.values
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    pub fn flags_mut(&mut self) -> &mut [String] {
        &mut self.flags
    }

    /// Moves the records of `other`, which must all be later than ours, to the end.
    pub fn append(&mut self, mut other: Self) {
        self.timestamps.append(&mut other.timestamps);
        self.values.append(&mut other.values);
        self.flags.append(&mut other.flags);
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamps.first().copied()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamps.last().copied()
    }

    pub fn record(&self, index: usize) -> Option<TimeseriesRecord> {
        Some(TimeseriesRecord {
            timestamp: *self.timestamps.get(index)?,
            value: self.values[index],
            flags: self.flags[index].clone(),
        })
    }

    pub fn last_record(&self) -> Option<TimeseriesRecord> {
        self.record(self.len().checked_sub(1)?)
    }

    pub fn records(&self) -> impl Iterator<Item = TimeseriesRecord> + '_ {
        (0..self.len()).filter_map(|i| self.record(i))
    }

    /// Records with `start <= timestamp <= end`; either bound may be open.
    ///
    /// Never panics: inverted or out-of-range bounds yield an empty result.
    pub fn slice(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        let from = match start {
            Some(start) => self.timestamps.partition_point(|t| *t < start),
            None => 0,
        };
        let to = match end {
            Some(end) => self.timestamps.partition_point(|t| *t <= end),
            None => self.len(),
        };
        if from >= to {
            return Self::new();
        }
        self.range(from, to)
    }

    /// Records strictly after `after`, or everything when `after` is `None`.
    pub fn after(&self, after: Option<DateTime<Utc>>) -> Self {
        match after {
            Some(after) => {
                let from = self.timestamps.partition_point(|t| *t <= after);
                self.range(from, self.len())
            }
            None => self.clone(),
        }
    }

    fn range(&self, from: usize, to: usize) -> Self {
        Self {
            timestamps: self.timestamps[from..to].to_vec(),
            values: self.values[from..to].to_vec(),
            flags: self.flags[from..to].to_vec(),
        }
    }

    /// Sorts by timestamp and returns the first timestamp that occurs twice.
    pub fn sort_and_find_duplicate(&mut self) -> Option<DateTime<Utc>> {
        if self.timestamps.windows(2).any(|w| w[0] >= w[1]) {
            let mut order: Vec<usize> = (0..self.len()).collect();
            order.sort_by_key(|&i| self.timestamps[i]);
            *self = Self {
                timestamps: order.iter().map(|&i| self.timestamps[i]).collect(),
                values: order.iter().map(|&i| self.values[i]).collect(),
                flags: order.iter().map(|&i| self.flags[i].clone()).collect(),
            };
        }
        self.timestamps
            .windows(2)
            .find(|w| w[0] == w[1])
            .map(|w| w[0])
    }
}

/// Quality flags are space-separated tokens.
pub mod flags {
    pub const RANGE: &str = "RANGE";
    pub const SUSPECT: &str = "SUSPECT";
    pub const TEMPORAL: &str = "TEMPORAL";
    pub const MISSING_PREFIX: &str = "MISS";

    pub fn add(flags: &mut String, flag: &str) {
        if !flags.is_empty() {
            flags.push(' ');
        }
        flags.push_str(flag);
    }

    pub fn contains(flags: &str, flag: &str) -> bool {
        flags.split_whitespace().any(|f| f == flag)
    }

    /// True if any token marks an aggregate computed from incomplete input.
    pub fn has_missing(flags: &str) -> bool {
        flags
            .split_whitespace()
            .any(|f| f.starts_with(MISSING_PREFIX))
    }

    pub fn missing(count: usize) -> String {
        format!("MISSING{}", count)
    }

    pub fn normalize(flags: &str) -> String {
        flags.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}
