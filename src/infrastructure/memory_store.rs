// In-process record store: one ordered map per time series
use crate::application::record_store::{clamp_range, RecordStore, BATCH_SIZE};
use crate::domain::error::StoreError;
use crate::domain::timeseries::{TimeseriesData, TimeseriesId, TimeseriesRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

type Row = (Option<f64>, String);

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    series: RwLock<HashMap<TimeseriesId, BTreeMap<DateTime<Utc>, Row>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_no_duplicates(
        timeseries_id: TimeseriesId,
        existing: Option<&BTreeMap<DateTime<Utc>, Row>>,
        records: &TimeseriesData,
    ) -> Result<(), StoreError> {
        let mut previous: Option<DateTime<Utc>> = None;
        for timestamp in records.timestamps() {
            let collides = existing.is_some_and(|rows| rows.contains_key(timestamp));
            if collides || previous == Some(*timestamp) {
                return Err(StoreError::DuplicateTimestamp {
                    timeseries_id,
                    timestamp: *timestamp,
                });
            }
            previous = Some(*timestamp);
        }
        Ok(())
    }

    fn insert_all(rows: &mut BTreeMap<DateTime<Utc>, Row>, records: &TimeseriesData) -> usize {
        let mut count = 0;
        let timestamps = records.timestamps().chunks(BATCH_SIZE);
        let values = records.values().chunks(BATCH_SIZE);
        let flags = records.flags().chunks(BATCH_SIZE);
        for ((timestamps, values), flags) in timestamps.zip(values).zip(flags) {
            for ((timestamp, value), flags) in timestamps.iter().zip(values).zip(flags) {
                rows.insert(*timestamp, (*value, flags.clone()));
            }
            count += timestamps.len();
        }
        count
    }

    fn to_record((timestamp, (value, flags)): (&DateTime<Utc>, &Row)) -> TimeseriesRecord {
        TimeseriesRecord::new(*timestamp, *value, flags.clone())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn read_range(
        &self,
        timeseries_id: TimeseriesId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<TimeseriesData, StoreError> {
        let (start, end) = clamp_range(start, end);
        let series = self.series.read();
        let Some(rows) = series.get(&timeseries_id) else {
            return Ok(TimeseriesData::new());
        };
        if start > end {
            return Ok(TimeseriesData::new());
        }
        let mut data = TimeseriesData::new();
        for (timestamp, (value, flags)) in rows.range(start..=end) {
            data.push(*timestamp, *value, flags.clone());
        }
        Ok(data)
    }

    async fn bulk_append(
        &self,
        timeseries_id: TimeseriesId,
        records: &TimeseriesData,
    ) -> Result<usize, StoreError> {
        let mut series = self.series.write();
        Self::check_no_duplicates(timeseries_id, series.get(&timeseries_id), records)?;
        let rows = series.entry(timeseries_id).or_default();
        Ok(Self::insert_all(rows, records))
    }

    async fn latest(&self, timeseries_id: TimeseriesId) -> Result<Option<TimeseriesRecord>, StoreError> {
        let series = self.series.read();
        Ok(series
            .get(&timeseries_id)
            .and_then(|rows| rows.iter().next_back())
            .map(Self::to_record))
    }

    async fn earliest(&self, timeseries_id: TimeseriesId) -> Result<Option<TimeseriesRecord>, StoreError> {
        let series = self.series.read();
        Ok(series
            .get(&timeseries_id)
            .and_then(|rows| rows.iter().next())
            .map(Self::to_record))
    }

    async fn delete_range(
        &self,
        timeseries_id: TimeseriesId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<usize, StoreError> {
        let (start, end) = clamp_range(start, end);
        let mut series = self.series.write();
        let Some(rows) = series.get_mut(&timeseries_id) else {
            return Ok(0);
        };
        if start > end {
            return Ok(0);
        }
        let doomed: Vec<DateTime<Utc>> = rows.range(start..=end).map(|(t, _)| *t).collect();
        for timestamp in &doomed {
            rows.remove(timestamp);
        }
        Ok(doomed.len())
    }

    async fn replace_from(
        &self,
        timeseries_id: TimeseriesId,
        from: Option<DateTime<Utc>>,
        records: &TimeseriesData,
    ) -> Result<usize, StoreError> {
        let mut series = self.series.write();
        let rows = series.entry(timeseries_id).or_default();
        let mut tail = match from {
            Some(from) => rows.split_off(&from),
            None => std::mem::take(rows),
        };
        if let Err(error) = Self::check_no_duplicates(timeseries_id, Some(&*rows), records) {
            rows.append(&mut tail);
            return Err(error);
        }
        Ok(Self::insert_all(rows, records))
    }
}
