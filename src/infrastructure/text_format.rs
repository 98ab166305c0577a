// Line-oriented text format for time series records: "date,value,flags"
use crate::application::record_store::{max_timestamp, min_timestamp};
use crate::domain::error::StoreError;
use crate::domain::timeseries::{flags, TimeseriesData, TimeseriesRecord};
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use std::fmt::Write;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"];
const OFFSET_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%:z",
    "%Y-%m-%d %H:%M%:z",
    "%Y-%m-%d %H:%M:%S%z",
    "%Y-%m-%d %H:%M%z",
];

/// Parses one timestamp. Naive timestamps are taken to be in `default_tz`.
pub fn parse_timestamp(
    text: &str,
    default_tz: FixedOffset,
    line: usize,
) -> Result<DateTime<Utc>, StoreError> {
    let malformed = || StoreError::MalformedTimestamp {
        line,
        text: text.to_string(),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(malformed());
    }
    let normalized = normalize_timestamp(trimmed);

    let parsed = if let Some(naive) = NAIVE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(&normalized, f).ok())
    {
        naive
            .and_local_timezone(default_tz)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    } else {
        OFFSET_FORMATS
            .iter()
            .find_map(|f| DateTime::parse_from_str(&normalized, f).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };

    match parsed {
        Some(timestamp) if timestamp >= min_timestamp() && timestamp <= max_timestamp() => {
            Ok(timestamp)
        }
        _ => Err(malformed()),
    }
}

/// "2019-05-21T10:00Z" -> "2019-05-21 10:00+00:00"
fn normalize_timestamp(text: &str) -> String {
    let mut normalized = text.replacen('T', " ", 1);
    if normalized.ends_with('Z') || normalized.ends_with('z') {
        normalized.pop();
        normalized.push_str("+00:00");
    }
    normalized
}

fn parse_value(text: &str, line: usize) -> Result<Option<f64>, StoreError> {
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    text.parse::<f64>()
        .map(Some)
        .map_err(|_| StoreError::MalformedRecord {
            line,
            reason: format!("{:?} is not a number", text),
        })
}

/// Parses a whole blob. Blank lines are skipped; the result is in file order.
pub fn parse_records(text: &str, default_tz: FixedOffset) -> Result<TimeseriesData, StoreError> {
    let mut data = TimeseriesData::new();
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        if raw.trim().is_empty() {
            continue;
        }
        let mut fields = raw.splitn(3, ',');
        let timestamp = parse_timestamp(fields.next().unwrap_or_default(), default_tz, line)?;
        let value = match fields.next() {
            Some(value) => parse_value(value, line)?,
            None => {
                return Err(StoreError::MalformedRecord {
                    line,
                    reason: "expected at least a date and a value".to_string(),
                })
            }
        };
        let record_flags = flags::normalize(fields.next().unwrap_or_default());
        data.push(timestamp, value, record_flags);
    }
    Ok(data)
}

/// Renders a value with `precision` decimals; negative precision rounds to
/// tens, hundreds and so on.
pub fn format_value(value: Option<f64>, precision: i32) -> String {
    match value {
        None => String::new(),
        Some(v) if precision >= 0 => format!("{:.*}", precision as usize, v),
        Some(v) => {
            let unit = 10f64.powi(-precision);
            format!("{:.0}", (v / unit).round() * unit)
        }
    }
}

pub fn format_record(record: &TimeseriesRecord, tz: FixedOffset, precision: i32) -> String {
    format!(
        "{},{},{}",
        record.timestamp.with_timezone(&tz).format("%Y-%m-%d %H:%M"),
        format_value(record.value, precision),
        record.flags
    )
}

/// Renders records one per line, each terminated by "\r\n".
pub fn format_records(data: &TimeseriesData, tz: FixedOffset, precision: i32) -> String {
    let mut out = String::with_capacity(data.len() * 32);
    for record in data.records() {
        let _ = write!(out, "{}\r\n", format_record(&record, tz, precision));
    }
    out
}
