// InfluxDB 1.x record store: InfluxQL for reads, line protocol for writes
use crate::application::record_store::{clamp_range, min_timestamp, RecordStore};
use crate::domain::error::StoreError;
use crate::domain::timeseries::{TimeseriesData, TimeseriesId, TimeseriesRecord};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

const MEASUREMENT: &str = "timeseries_record";

#[derive(Debug, Clone)]
pub struct InfluxRecordStore {
    client: reqwest::Client,
    host: String,
    token: String,
    database: String,
    retention_policy: String,
}

#[derive(Debug, Deserialize)]
struct InfluxQLResponse {
    results: Vec<InfluxQLResult>,
}

#[derive(Debug, Deserialize)]
struct InfluxQLResult {
    #[serde(default)]
    series: Option<Vec<InfluxQLSeries>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfluxQLSeries {
    columns: Vec<String>,
    values: Vec<Vec<serde_json::Value>>,
}

impl InfluxRecordStore {
    pub fn new(host: String, token: String, database: String, retention_policy: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: host.trim_end_matches('/').to_string(),
            token,
            database,
            retention_policy,
        }
    }

    fn build_query_url(&self, query: &str) -> String {
        format!(
            "{}/query?db={}&rp={}&q={}",
            self.host,
            urlencoding::encode(&self.database),
            urlencoding::encode(&self.retention_policy),
            urlencoding::encode(query)
        )
    }

    fn build_write_url(&self) -> String {
        format!(
            "{}/write?db={}&rp={}&precision=s",
            self.host,
            urlencoding::encode(&self.database),
            urlencoding::encode(&self.retention_policy)
        )
    }

    async fn execute_query(&self, query: &str) -> Result<InfluxQLResponse, StoreError> {
        tracing::debug!(query, "executing InfluxQL");
        let response = self
            .client
            .get(self.build_query_url(query))
            .header("Authorization", format!("Token {}", self.token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(StoreError::backend)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Backend(format!(
                "InfluxDB query failed with status {}: {}",
                status, body
            )));
        }

        let data = response
            .json::<InfluxQLResponse>()
            .await
            .map_err(StoreError::backend)?;
        if let Some(error) = data.results.iter().find_map(|r| r.error.as_ref()) {
            return Err(StoreError::Backend(format!("InfluxDB query error: {}", error)));
        }
        Ok(data)
    }

    /// One request per call, so InfluxDB accepts or rejects the records as a whole.
    async fn write(&self, timeseries_id: TimeseriesId, records: &TimeseriesData) -> Result<usize, StoreError> {
        let count = records.len();
        let response = self
            .client
            .post(self.build_write_url())
            .header("Authorization", format!("Token {}", self.token))
            .body(write_body(timeseries_id, records))
            .send()
            .await
            .map_err(StoreError::backend)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Backend(format!(
                "InfluxDB write failed with status {}: {}",
                status, body
            )));
        }
        tracing::debug!(timeseries_id, count, "wrote records to InfluxDB");
        Ok(count)
    }

    async fn select(&self, timeseries_id: TimeseriesId, filter: &str, tail: &str) -> Result<TimeseriesData, StoreError> {
        let query = format!(
            "SELECT value, flags FROM {} WHERE timeseries_id = '{}'{} {}",
            MEASUREMENT, timeseries_id, filter, tail
        );
        let response = self.execute_query(&query).await?;
        parse_records(&response)
    }

    /// Fails if `records` repeats a timestamp or hits one already stored.
    async fn check_no_duplicates(
        &self,
        timeseries_id: TimeseriesId,
        records: &TimeseriesData,
        stored_from: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        if let Some(pair) = records.timestamps().windows(2).find(|w| w[0] >= w[1]) {
            return Err(StoreError::DuplicateTimestamp {
                timeseries_id,
                timestamp: pair[1],
            });
        }
        let (Some(first), Some(last)) = (records.first_timestamp(), records.last_timestamp()) else {
            return Ok(());
        };
        // Records at or after `stored_from` are about to be deleted
        let last = stored_from.map_or(last, |from| last.min(from - chrono::Duration::seconds(1)));
        if last < first {
            return Ok(());
        }
        let existing = self
            .select(timeseries_id, &time_filter(first, last), "ORDER BY time ASC")
            .await?;
        match existing.timestamps().iter().find(|t| records.timestamps().binary_search(t).is_ok()) {
            Some(timestamp) => Err(StoreError::DuplicateTimestamp {
                timeseries_id,
                timestamp: *timestamp,
            }),
            None => Ok(()),
        }
    }
}

fn time_literal(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn time_filter(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(" AND time >= '{}' AND time <= '{}'", time_literal(start), time_literal(end))
}

/// `timeseries_record,timeseries_id=3 flags="RANGE",value=1.5 1558432800`;
/// a missing value is left out of the field set.
fn line_protocol(timeseries_id: TimeseriesId, record: &TimeseriesRecord) -> String {
    let flags = record.flags.replace('\\', "\\\\").replace('"', "\\\"");
    let value = record
        .value
        .map(|v| format!(",value={:?}", v))
        .unwrap_or_default();
    format!(
        "{},timeseries_id={} flags=\"{}\"{} {}",
        MEASUREMENT,
        timeseries_id,
        flags,
        value,
        record.timestamp.timestamp()
    )
}

fn write_body(timeseries_id: TimeseriesId, records: &TimeseriesData) -> String {
    records
        .records()
        .map(|record| line_protocol(timeseries_id, &record))
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_records(response: &InfluxQLResponse) -> Result<TimeseriesData, StoreError> {
    let mut data = TimeseriesData::new();
    let series = response
        .results
        .iter()
        .filter_map(|r| r.series.as_ref())
        .flatten();
    for s in series {
        let column = |name: &str| s.columns.iter().position(|c| c == name);
        let time_idx = column("time").unwrap_or(0);
        let value_idx = column("value");
        let flags_idx = column("flags");
        for row in &s.values {
            let time = row
                .get(time_idx)
                .and_then(|v| v.as_str())
                .ok_or_else(|| StoreError::Backend("InfluxDB row without time".to_string()))?;
            let timestamp = DateTime::parse_from_rfc3339(time)
                .map_err(StoreError::backend)?
                .with_timezone(&Utc);
            let value = value_idx.and_then(|i| row.get(i)).and_then(|v| v.as_f64());
            let flags = flags_idx
                .and_then(|i| row.get(i))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            data.push(timestamp, value, flags);
        }
    }
    Ok(data)
}

#[async_trait]
impl RecordStore for InfluxRecordStore {
    async fn read_range(
        &self,
        timeseries_id: TimeseriesId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<TimeseriesData, StoreError> {
        let (start, end) = clamp_range(start, end);
        self.select(timeseries_id, &time_filter(start, end), "ORDER BY time ASC")
            .await
    }

    async fn bulk_append(&self, timeseries_id: TimeseriesId, records: &TimeseriesData) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        self.check_no_duplicates(timeseries_id, records, None).await?;
        self.write(timeseries_id, records).await
    }

    async fn latest(&self, timeseries_id: TimeseriesId) -> Result<Option<TimeseriesRecord>, StoreError> {
        let data = self.select(timeseries_id, "", "ORDER BY time DESC LIMIT 1").await?;
        Ok(data.last_record())
    }

    async fn earliest(&self, timeseries_id: TimeseriesId) -> Result<Option<TimeseriesRecord>, StoreError> {
        let data = self.select(timeseries_id, "", "ORDER BY time ASC LIMIT 1").await?;
        Ok(data.record(0))
    }

    async fn delete_range(
        &self,
        timeseries_id: TimeseriesId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<usize, StoreError> {
        let (start, end) = clamp_range(start, end);
        let filter = time_filter(start, end);
        let existing = self.select(timeseries_id, &filter, "").await?;
        if existing.is_empty() {
            return Ok(0);
        }
        let query = format!(
            "DELETE FROM {} WHERE timeseries_id = '{}'{}",
            MEASUREMENT, timeseries_id, filter
        );
        self.execute_query(&query).await?;
        Ok(existing.len())
    }

    /// Validates before deleting, but InfluxDB has no transactions: a failed
    /// write after the delete leaves the tail removed.
    async fn replace_from(
        &self,
        timeseries_id: TimeseriesId,
        from: Option<DateTime<Utc>>,
        records: &TimeseriesData,
    ) -> Result<usize, StoreError> {
        let from_or_min = from.unwrap_or_else(min_timestamp);
        self.check_no_duplicates(timeseries_id, records, Some(from_or_min))
            .await?;
        self.delete_range(timeseries_id, from, None).await?;
        if records.is_empty() {
            return Ok(0);
        }
        self.write(timeseries_id, records).await
    }
}
