// Repository trait for time series record storage
use crate::domain::error::StoreError;
use crate::domain::timeseries::{TimeseriesData, TimeseriesId, TimeseriesRecord};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

/// Records are written to the backend in batches of this size.
pub const BATCH_SIZE: usize = 1000;

/// Earliest representable timestamp (1678-01-01T00:00:00Z).
pub fn min_timestamp() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(1678, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Latest representable timestamp (2261-12-31T23:59:59Z).
pub fn max_timestamp() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(2261, 12, 31)
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Replaces open bounds with the representable range.
pub fn clamp_range(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = start.map_or_else(min_timestamp, |s| s.max(min_timestamp()));
    let end = end.map_or_else(max_timestamp, |e| e.min(max_timestamp()));
    (start, end)
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records with `start <= timestamp <= end`, ordered by timestamp
    async fn read_range(
        &self,
        timeseries_id: TimeseriesId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<TimeseriesData, StoreError>;

    /// Insert records; fails without writing anything if any timestamp exists
    async fn bulk_append(
        &self,
        timeseries_id: TimeseriesId,
        records: &TimeseriesData,
    ) -> Result<usize, StoreError>;

    async fn latest(&self, timeseries_id: TimeseriesId) -> Result<Option<TimeseriesRecord>, StoreError>;

    async fn earliest(&self, timeseries_id: TimeseriesId) -> Result<Option<TimeseriesRecord>, StoreError>;

    /// Delete records with `start <= timestamp <= end`, returning how many went
    async fn delete_range(
        &self,
        timeseries_id: TimeseriesId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<usize, StoreError>;

    /// Delete every record at or after `from` (all records when `None`) and insert
    /// `records`, as one unit
    async fn replace_from(
        &self,
        timeseries_id: TimeseriesId,
        from: Option<DateTime<Utc>>,
        records: &TimeseriesData,
    ) -> Result<usize, StoreError>;
}
