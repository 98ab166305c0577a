// Station and time series group domain models
use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;

pub type StationId = i64;
pub type GroupId = i64;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Location {
    pub abscissa: f64,
    pub ordinate: f64,
    pub srid: i32,
    pub altitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub id: StationId,
    pub name: String,
    pub location: Option<Location>,
}

/// Display time zone: a code plus a fixed offset from UTC.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DisplayTimezone {
    pub code: String,
    pub utc_offset_minutes: i32,
}

impl DisplayTimezone {
    pub fn utc() -> Self {
        Self {
            code: "UTC".to_string(),
            utc_offset_minutes: 0,
        }
    }

    pub fn new(code: impl Into<String>, utc_offset_minutes: i32) -> Self {
        Self {
            code: code.into(),
            utc_offset_minutes,
        }
    }

    pub fn offset(&self) -> FixedOffset {
        // Offsets beyond a day cannot be represented; fall back to UTC.
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    /// Parses `UTC`, `+02:00`, `-0330`, `UTC+0200` or a full `EET (UTC+0200)` label.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("utc") || text == "Z" {
            return Some(Self::utc());
        }
        let (code, offset) = match text.split_once(" (UTC") {
            Some((code, rest)) => (code.to_string(), rest.strip_suffix(')')?),
            None => match text.strip_prefix("UTC") {
                Some(rest) => (format!("UTC{}", rest), rest),
                None => (text.to_string(), text),
            },
        };
        let (sign, digits) = match offset.as_bytes().first()? {
            b'+' => (1, &offset[1..]),
            b'-' => (-1, &offset[1..]),
            _ => return None,
        };
        let digits = digits.replace(':', "");
        if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let hours: i32 = digits[..2].parse().ok()?;
        let minutes: i32 = digits[2..].parse().ok()?;
        if hours > 23 || minutes > 59 {
            return None;
        }
        Some(Self::new(code, sign * (hours * 60 + minutes)))
    }

    /// `"EET (UTC+0200)"`
    pub fn label(&self) -> String {
        let sign = if self.utc_offset_minutes < 0 { '-' } else { '+' };
        let minutes = self.utc_offset_minutes.abs();
        format!(
            "{} (UTC{}{:02}{:02})",
            self.code,
            sign,
            minutes / 60,
            minutes % 60
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeseriesGroup {
    pub id: GroupId,
    pub station_id: StationId,
    pub variable: String,
    pub unit_symbol: String,
    pub name: String,
    pub precision: i32,
    pub time_zone: DisplayTimezone,
    pub remarks: String,
    pub hidden: bool,
}

impl TimeseriesGroup {
    /// The explicit name, or the variable when no name was given.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.variable
        } else {
            &self.name
        }
    }
}
