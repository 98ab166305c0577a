// Time series façade: record store + series cache + catalog metadata
use crate::application::catalog::Catalog;
use crate::application::outbox::TriggerOutbox;
use crate::application::record_store::RecordStore;
use crate::application::series_cache::{CacheKey, Scope, SeriesCache};
use crate::domain::error::StoreError;
use crate::domain::station::{DisplayTimezone, GroupId, Location, StationId, TimeseriesGroup};
use crate::domain::time_step::TimeStep;
use crate::domain::timeseries::{
    Timeseries, TimeseriesData, TimeseriesId, TimeseriesKey, TimeseriesRecord, TimeseriesType,
};
use crate::infrastructure::text_format::parse_records;
use chrono::{DateTime, FixedOffset, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Stage preference for a group's representative series.
const DEFAULT_STAGES: [TimeseriesType; 3] = [
    TimeseriesType::Regularized,
    TimeseriesType::Checked,
    TimeseriesType::Initial,
];

/// Records to write, either raw text or already parsed.
#[derive(Debug, Clone)]
pub enum DataInput<'a> {
    Text(&'a str),
    Series(TimeseriesData),
}

impl<'a> From<&'a str> for DataInput<'a> {
    fn from(text: &'a str) -> Self {
        DataInput::Text(text)
    }
}

impl From<TimeseriesData> for DataInput<'_> {
    fn from(data: TimeseriesData) -> Self {
        DataInput::Series(data)
    }
}

impl DataInput<'_> {
    fn into_data(self, default_tz: FixedOffset) -> Result<TimeseriesData, StoreError> {
        match self {
            DataInput::Text(text) => parse_records(text, default_tz),
            DataInput::Series(data) => Ok(data),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesMetadata {
    pub title: String,
    pub variable: String,
    pub unit: String,
    pub precision: i32,
    pub time_step: Option<TimeStep>,
    pub timezone: DisplayTimezone,
    pub location: Option<Location>,
    pub comment: String,
}

/// Records of one time series plus what an exporter needs to render them.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasuredSeries {
    pub data: TimeseriesData,
    pub metadata: SeriesMetadata,
}

#[derive(Clone)]
pub struct TimeseriesStore {
    records: Arc<dyn RecordStore>,
    cache: Arc<SeriesCache>,
    catalog: Arc<Catalog>,
    outbox: Arc<TriggerOutbox>,
    write_locks: Arc<parking_lot::Mutex<HashMap<TimeseriesId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl TimeseriesStore {
    pub fn new(records: Arc<dyn RecordStore>, catalog: Arc<Catalog>, outbox: Arc<TriggerOutbox>) -> Self {
        Self {
            records,
            cache: Arc::new(SeriesCache::new()),
            catalog,
            outbox,
            write_locks: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn outbox(&self) -> &Arc<TriggerOutbox> {
        &self.outbox
    }

    /// Get-or-create a group's time series, wiring it into the cache graph.
    pub fn ensure_timeseries(&self, group_id: GroupId, key: TimeseriesKey) -> Result<Timeseries, StoreError> {
        let (timeseries, _) = self.catalog.ensure_timeseries(group_id, key)?;
        self.lookup(timeseries.id)?;
        Ok(timeseries)
    }

    fn lookup(&self, timeseries_id: TimeseriesId) -> Result<(Timeseries, TimeseriesGroup), StoreError> {
        let timeseries = self.catalog.timeseries(timeseries_id)?;
        let group = self.catalog.group(timeseries.group_id)?;
        self.cache
            .register_owner(Scope::Timeseries(timeseries.id), Scope::Group(group.id));
        self.cache
            .register_owner(Scope::Group(group.id), Scope::Station(group.station_id));
        Ok((timeseries, group))
    }

    fn write_lock(&self, timeseries_id: TimeseriesId) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .entry(timeseries_id)
            .or_default()
            .clone()
    }

    /// The full series, from the cache when warm.
    async fn full_data(&self, timeseries_id: TimeseriesId) -> Result<Arc<TimeseriesData>, StoreError> {
        if let Some(data) = self.cache.data(timeseries_id) {
            return Ok(data);
        }
        tracing::debug!(timeseries_id, "series cache miss");
        let generation = self.cache.generation(Scope::Timeseries(timeseries_id));
        let data = Arc::new(self.records.read_range(timeseries_id, None, None).await?);
        self.cache.store_data(timeseries_id, generation, data.clone());
        Ok(data)
    }

    /// Records with `start <= timestamp <= end`, tagged for display in
    /// `timezone` (the group's time zone when `None`).
    pub async fn get_data(
        &self,
        timeseries_id: TimeseriesId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        timezone: Option<DisplayTimezone>,
    ) -> Result<MeasuredSeries, StoreError> {
        let (timeseries, group) = self.lookup(timeseries_id)?;
        let station = self.catalog.station(group.station_id)?;
        let full = self.full_data(timeseries_id).await?;
        let data = full.slice(start, end);

        let comment = if group.remarks.is_empty() {
            station.name.clone()
        } else {
            format!("{}\n\n{}", station.name, group.remarks)
        };
        let metadata = SeriesMetadata {
            title: format!("{} - {}", group.display_name(), timeseries.label()),
            variable: group.variable.clone(),
            unit: group.unit_symbol.clone(),
            precision: group.precision,
            time_step: timeseries.time_step,
            timezone: timezone.unwrap_or_else(|| group.time_zone.clone()),
            location: station.location.clone(),
            comment,
        };
        Ok(MeasuredSeries { data, metadata })
    }

    /// Replaces all records of the series.
    pub async fn set_data<'a>(
        &self,
        timeseries_id: TimeseriesId,
        input: impl Into<DataInput<'a>>,
        default_timezone: Option<&DisplayTimezone>,
    ) -> Result<usize, StoreError> {
        let data = self.prepare(timeseries_id, input.into(), default_timezone)?;
        let lock = self.write_lock(timeseries_id);
        let _guard = lock.lock().await;

        let count = self.records.replace_from(timeseries_id, None, &data).await?;
        self.cache.invalidate(timeseries_id);
        tracing::info!(timeseries_id, count, "replaced time series data");
        if count > 0 {
            self.outbox.push(timeseries_id);
        }
        Ok(count)
    }

    /// Appends records strictly after the current last record.
    pub async fn append_data<'a>(
        &self,
        timeseries_id: TimeseriesId,
        input: impl Into<DataInput<'a>>,
        default_timezone: Option<&DisplayTimezone>,
    ) -> Result<usize, StoreError> {
        let data = self.prepare(timeseries_id, input.into(), default_timezone)?;
        let Some(new_start) = data.first_timestamp() else {
            return Ok(0);
        };
        let lock = self.write_lock(timeseries_id);
        let _guard = lock.lock().await;

        if let Some(last) = self.records.latest(timeseries_id).await? {
            if new_start <= last.timestamp {
                return Err(StoreError::OutOfOrderAppend {
                    timeseries_id,
                    new_start,
                    last: last.timestamp,
                });
            }
        }
        let count = self.records.bulk_append(timeseries_id, &data).await?;
        self.cache.invalidate(timeseries_id);
        tracing::info!(timeseries_id, count, "appended time series data");
        self.outbox.push(timeseries_id);
        Ok(count)
    }

    /// Deletes every record at or after `from` and writes `data` in their place,
    /// as one unit. `data` must not start before `from`.
    pub async fn replace_tail(
        &self,
        timeseries_id: TimeseriesId,
        from: DateTime<Utc>,
        mut data: TimeseriesData,
    ) -> Result<usize, StoreError> {
        self.lookup(timeseries_id)?;
        if let Some(timestamp) = data.sort_and_find_duplicate() {
            return Err(StoreError::DuplicateTimestamp {
                timeseries_id,
                timestamp,
            });
        }
        if let Some(new_start) = data.first_timestamp() {
            if new_start < from {
                return Err(StoreError::OutOfOrderAppend {
                    timeseries_id,
                    new_start,
                    last: from,
                });
            }
        }
        let lock = self.write_lock(timeseries_id);
        let _guard = lock.lock().await;

        let count = self.records.replace_from(timeseries_id, Some(from), &data).await?;
        self.cache.invalidate(timeseries_id);
        tracing::info!(timeseries_id, count, %from, "replaced time series tail");
        self.outbox.push(timeseries_id);
        Ok(count)
    }

    fn prepare(
        &self,
        timeseries_id: TimeseriesId,
        input: DataInput<'_>,
        default_timezone: Option<&DisplayTimezone>,
    ) -> Result<TimeseriesData, StoreError> {
        let (_, group) = self.lookup(timeseries_id)?;
        let tz = default_timezone.unwrap_or(&group.time_zone).offset();
        let mut data = input.into_data(tz)?;
        if let Some(timestamp) = data.sort_and_find_duplicate() {
            return Err(StoreError::DuplicateTimestamp {
                timeseries_id,
                timestamp,
            });
        }
        Ok(data)
    }

    pub async fn last_record(&self, timeseries_id: TimeseriesId) -> Result<Option<TimeseriesRecord>, StoreError> {
        self.lookup(timeseries_id)?;
        self.records.latest(timeseries_id).await
    }

    /// Last record strictly before `before`.
    pub async fn record_before(
        &self,
        timeseries_id: TimeseriesId,
        before: DateTime<Utc>,
    ) -> Result<Option<TimeseriesRecord>, StoreError> {
        self.lookup(timeseries_id)?;
        let full = self.full_data(timeseries_id).await?;
        let index = full.timestamps().partition_point(|t| *t < before);
        Ok(index.checked_sub(1).and_then(|i| full.record(i)))
    }

    pub async fn start_date(&self, timeseries_id: TimeseriesId) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.lookup(timeseries_id)?;
        let key = CacheKey::StartDate(Scope::Timeseries(timeseries_id));
        if let Some(date) = self.cache.date(key) {
            return Ok(date);
        }
        let generation = self.cache.generation(Scope::Timeseries(timeseries_id));
        let date = self.records.earliest(timeseries_id).await?.map(|r| r.timestamp);
        self.cache.store_date(key, generation, date);
        Ok(date)
    }

    pub async fn end_date(&self, timeseries_id: TimeseriesId) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.lookup(timeseries_id)?;
        let key = CacheKey::EndDate(Scope::Timeseries(timeseries_id));
        if let Some(date) = self.cache.date(key) {
            return Ok(date);
        }
        let generation = self.cache.generation(Scope::Timeseries(timeseries_id));
        let date = self.records.latest(timeseries_id).await?.map(|r| r.timestamp);
        self.cache.store_date(key, generation, date);
        Ok(date)
    }

    /// Time series representing the group: Regularized, else Checked, else Initial.
    pub fn default_timeseries(&self, group_id: GroupId) -> Result<Option<Timeseries>, StoreError> {
        self.catalog.group(group_id)?;
        let found = self.catalog.preferred_timeseries(group_id, &DEFAULT_STAGES);
        if let Some(timeseries) = &found {
            self.lookup(timeseries.id)?;
        }
        Ok(found)
    }

    pub async fn group_start_date(&self, group_id: GroupId) -> Result<Option<DateTime<Utc>>, StoreError> {
        let key = CacheKey::StartDate(Scope::Group(group_id));
        if let Some(date) = self.cache.date(key) {
            return Ok(date);
        }
        let generation = self.cache.generation(Scope::Group(group_id));
        let date = match self.default_timeseries(group_id)? {
            Some(timeseries) => self.start_date(timeseries.id).await?,
            None => None,
        };
        self.cache.store_date(key, generation, date);
        Ok(date)
    }

    pub async fn group_end_date(&self, group_id: GroupId) -> Result<Option<DateTime<Utc>>, StoreError> {
        let key = CacheKey::EndDate(Scope::Group(group_id));
        if let Some(date) = self.cache.date(key) {
            return Ok(date);
        }
        let generation = self.cache.generation(Scope::Group(group_id));
        let date = match self.default_timeseries(group_id)? {
            Some(timeseries) => self.end_date(timeseries.id).await?,
            None => None,
        };
        self.cache.store_date(key, generation, date);
        Ok(date)
    }

    /// Latest end date among the station's groups.
    pub async fn station_last_update(&self, station_id: StationId) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.catalog.station(station_id)?;
        let key = CacheKey::EndDate(Scope::Station(station_id));
        if let Some(date) = self.cache.date(key) {
            return Ok(date);
        }
        let generation = self.cache.generation(Scope::Station(station_id));
        let mut last_update = None;
        for group in self.catalog.groups_of_station(station_id) {
            last_update = last_update.max(self.group_end_date(group.id).await?);
        }
        self.cache.store_date(key, generation, last_update);
        Ok(last_update)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::application::catalog::tests::catalog_with_group;
    use crate::infrastructure::memory_store::MemoryRecordStore;
    use chrono::TimeZone;

    pub(crate) fn store() -> TimeseriesStore {
        TimeseriesStore::new(
            Arc::new(MemoryRecordStore::new()),
            Arc::new(catalog_with_group()),
            Arc::new(TriggerOutbox::new()),
        )
    }

    fn initial(store: &TimeseriesStore) -> TimeseriesId {
        store
            .ensure_timeseries(1, TimeseriesKey::stage(TimeseriesType::Initial))
            .unwrap()
            .id
    }

    fn utc(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 5, 21, hour, minute, 0).unwrap()
    }

    // The test group displays in EET (UTC+0200)
    const BLOB: &str = "2019-05-21 12:00,1.5,\n2019-05-21 12:10,2.5,A\n2019-05-21 12:20,,\n";

    #[tokio::test]
    async fn test_append_then_get() {
        let store = store();
        let id = initial(&store);
        assert_eq!(store.append_data(id, BLOB, None).await.unwrap(), 3);

        let series = store.get_data(id, None, None, None).await.unwrap();
        assert_eq!(series.data.timestamps(), &[utc(10, 0), utc(10, 10), utc(10, 20)]);
        assert_eq!(series.data.values(), &[Some(1.5), Some(2.5), None]);
        assert_eq!(series.metadata.timezone.label(), "EET (UTC+0200)");
        assert_eq!(series.metadata.unit, "m");
        assert_eq!(series.metadata.comment, "Hobbiton");
        assert_eq!(series.metadata.title, "Water level - Initial");
    }

    #[tokio::test]
    async fn test_default_timezone_overrides_group() {
        let store = store();
        let id = initial(&store);
        store
            .append_data(id, "2019-05-21 10:00,1,\n", Some(&DisplayTimezone::utc()))
            .await
            .unwrap();
        assert_eq!(store.end_date(id).await.unwrap(), Some(utc(10, 0)));
    }

    #[tokio::test]
    async fn test_out_of_order_append_leaves_series_unchanged() {
        let store = store();
        let id = initial(&store);
        store.append_data(id, BLOB, None).await.unwrap();

        let err = store
            .append_data(id, "2019-05-21 12:20,9,\n2019-05-21 12:30,9,\n", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrderAppend { .. }));
        assert_eq!(store.get_data(id, None, None, None).await.unwrap().data.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_within_batch() {
        let store = store();
        let id = initial(&store);
        let err = store
            .append_data(id, "2019-05-21 12:00,1,\n2019-05-21 12:00,2,\n", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateTimestamp { .. }));
    }

    #[tokio::test]
    async fn test_cache_is_transparent() {
        let store = store();
        let id = initial(&store);
        store.append_data(id, BLOB, None).await.unwrap();

        let cold = store.get_data(id, Some(utc(10, 5)), Some(utc(10, 20)), None).await.unwrap();
        let warm = store.get_data(id, Some(utc(10, 5)), Some(utc(10, 20)), None).await.unwrap();
        assert_eq!(cold, warm);
        assert_eq!(cold.data.len(), 2);

        // A write invalidates before returning
        store.append_data(id, "2019-05-21 12:30,4,\n", None).await.unwrap();
        let after = store.get_data(id, None, None, None).await.unwrap();
        assert_eq!(after.data.len(), 4);
    }

    #[tokio::test]
    async fn test_set_data_round_trip() {
        let store = store();
        let id = initial(&store);
        store.append_data(id, BLOB, None).await.unwrap();

        let mut replacement = TimeseriesData::new();
        replacement.push(utc(8, 0), Some(7.0), "X");
        store.set_data(id, replacement.clone(), None).await.unwrap();

        let series = store.get_data(id, None, None, None).await.unwrap();
        assert_eq!(series.data, replacement);
    }

    #[tokio::test]
    async fn test_append_fires_trigger_but_empty_append_does_not() {
        let store = store();
        let id = initial(&store);
        assert_eq!(store.append_data(id, "", None).await.unwrap(), 0);
        assert!(store.outbox().is_empty());
        store.append_data(id, BLOB, None).await.unwrap();
        assert_eq!(store.outbox().drain(), vec![id]);
    }

    #[tokio::test]
    async fn test_replace_tail() {
        let store = store();
        let id = initial(&store);
        store.append_data(id, BLOB, None).await.unwrap();

        let mut tail = TimeseriesData::new();
        tail.push(utc(10, 20), Some(3.0), "");
        tail.push(utc(10, 30), Some(4.0), "");
        store.replace_tail(id, utc(10, 20), tail).await.unwrap();

        let series = store.get_data(id, None, None, None).await.unwrap();
        assert_eq!(series.data.values(), &[Some(1.5), Some(2.5), Some(3.0), Some(4.0)]);
        let before = store.record_before(id, utc(10, 20)).await.unwrap().unwrap();
        assert_eq!(before.timestamp, utc(10, 10));
    }

    #[tokio::test]
    async fn test_rollups_follow_default_series() {
        let store = store();
        let initial = initial(&store);
        store.append_data(initial, BLOB, None).await.unwrap();
        assert_eq!(store.group_end_date(1).await.unwrap(), Some(utc(10, 20)));
        assert_eq!(store.station_last_update(1).await.unwrap(), Some(utc(10, 20)));

        // Appending must invalidate the group and station rollups too
        store.append_data(initial, "2019-05-21 12:40,1,\n", None).await.unwrap();
        assert_eq!(store.group_end_date(1).await.unwrap(), Some(utc(10, 40)));
        assert_eq!(store.station_last_update(1).await.unwrap(), Some(utc(10, 40)));
        assert_eq!(store.group_start_date(1).await.unwrap(), Some(utc(10, 0)));

        // Once a checked series exists it represents the group
        let checked = store
            .ensure_timeseries(1, TimeseriesKey::stage(TimeseriesType::Checked))
            .unwrap();
        store.append_data(checked.id, "2019-05-21 11:00,1,\n", None).await.unwrap();
        assert_eq!(store.group_end_date(1).await.unwrap(), Some(utc(9, 0)));
    }

    #[tokio::test]
    async fn test_unknown_timeseries() {
        let store = store();
        let err = store.get_data(42, None, None, None).await.unwrap_err();
        assert!(matches!(err, StoreError::TimeseriesNotFound(42)));
    }
}
