// Piecewise-linear calibration curves, one per validity period
use super::{ProcessContext, Processor};
use crate::domain::error::{ProcessError, ValidationError};
use crate::domain::station::GroupId;
use crate::domain::timeseries::TimeseriesData;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

#[derive(Debug, Clone, PartialEq)]
pub struct CurvePeriod {
    start_date: NaiveDate,
    end_date: NaiveDate,
    points: Vec<(f64, f64)>,
}

impl CurvePeriod {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate, mut points: Vec<(f64, f64)>) -> Result<Self, ValidationError> {
        if end_date < start_date {
            return Err(ValidationError::InvertedPeriod {
                start: start_date.to_string(),
            });
        }
        if points.is_empty() {
            return Err(ValidationError::EmptyCurve {
                start: start_date.to_string(),
                end: end_date.to_string(),
            });
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        if let Some(pair) = points.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(ValidationError::DuplicateCurveX {
                start: start_date.to_string(),
                end: end_date.to_string(),
                x: pair[0].0,
            });
        }
        Ok(Self {
            start_date,
            end_date,
            points,
        })
    }

    /// Parses one `x,y` or `x<TAB>y` pair per line.
    pub fn parse_points(text: &str) -> Result<Vec<(f64, f64)>, ValidationError> {
        let mut points = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let invalid = |reason: String| ValidationError::InvalidCurvePoint {
                line: index + 1,
                reason,
            };
            let (x, y) = line
                .split_once(',')
                .or_else(|| line.split_once('\t'))
                .ok_or_else(|| invalid(format!("\"{}\" is not an x,y pair", line)))?;
            let number = |s: &str| {
                s.trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| invalid(format!("\"{}\" is not a number", s.trim())))
            };
            points.push((number(x)?, number(y)?));
        }
        Ok(points)
    }

    pub fn points_as_text(&self) -> String {
        self.points
            .iter()
            .map(|(x, y)| format!("{}\t{}\n", x, y))
            .collect()
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start_date
    }

    pub fn end_date(&self) -> NaiveDate {
        self.end_date
    }

    /// From the first day's 00:00 to the last day's 23:59, local time.
    fn contains(&self, local: NaiveDateTime) -> bool {
        let start = self.start_date.and_time(NaiveTime::MIN);
        let end = self
            .end_date
            .and_hms_opt(23, 59, 0)
            .unwrap_or_else(|| self.end_date.and_time(NaiveTime::MIN));
        local >= start && local <= end
    }

    /// Linear interpolation over the points; no extrapolation.
    pub fn interpolate(&self, x: f64) -> Option<f64> {
        let first = self.points.first()?;
        let last = self.points.last()?;
        if x < first.0 || x > last.0 {
            return None;
        }
        let upper = self.points.partition_point(|p| p.0 < x);
        let (x1, y1) = self.points[upper];
        if x1 == x || upper == 0 {
            return Some(y1);
        }
        let (x0, y0) = self.points[upper - 1];
        Some(y0 + (x - x0) * (y1 - y0) / (x1 - x0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CurveInterpolation {
    pub target_group_id: GroupId,
    periods: Vec<CurvePeriod>,
}

impl CurveInterpolation {
    pub fn new(target_group_id: GroupId, mut periods: Vec<CurvePeriod>) -> Result<Self, ValidationError> {
        periods.sort_by_key(|p| p.start_date);
        if let Some(pair) = periods.windows(2).find(|w| w[1].start_date <= w[0].end_date) {
            return Err(ValidationError::OverlappingPeriods {
                first: format!("{} - {}", pair[0].start_date, pair[0].end_date),
                second: format!("{} - {}", pair[1].start_date, pair[1].end_date),
            });
        }
        Ok(Self {
            target_group_id,
            periods,
        })
    }

    pub fn periods(&self) -> &[CurvePeriod] {
        &self.periods
    }

    fn period_for(&self, local: NaiveDateTime) -> Option<&CurvePeriod> {
        self.periods.iter().find(|p| p.contains(local))
    }
}

impl Processor for CurveInterpolation {
    /// Transforms values only; flags pass through untouched.
    fn process(&self, source: &TimeseriesData, ctx: &ProcessContext) -> Result<TimeseriesData, ProcessError> {
        let mut result = TimeseriesData::with_capacity(source.len());
        for record in source.records() {
            let local = record.timestamp.with_timezone(&ctx.time_zone).naive_local();
            let value = record
                .value
                .zip(self.period_for(local))
                .and_then(|(x, period)| period.interpolate(x));
            result.push(record.timestamp, value, record.flags);
        }
        Ok(result)
    }
}
