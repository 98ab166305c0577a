// Range and rate-of-change quality checks
use super::{ProcessContext, Processor};
use crate::domain::error::{ProcessError, ValidationError};
use crate::domain::time_step::DeltaT;
use crate::domain::timeseries::{flags, TimeseriesData};
use chrono::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RangeCheck {
    lower_bound: f64,
    upper_bound: f64,
    soft_bounds: Option<(f64, f64)>,
}

impl RangeCheck {
    pub fn new(lower_bound: f64, upper_bound: f64) -> Result<Self, ValidationError> {
        if lower_bound > upper_bound {
            return Err(ValidationError::InvertedBounds {
                field: "lower_bound",
                lower: lower_bound,
                upper: upper_bound,
            });
        }
        Ok(Self {
            lower_bound,
            upper_bound,
            soft_bounds: None,
        })
    }

    pub fn with_soft_bounds(mut self, soft_lower: f64, soft_upper: f64) -> Result<Self, ValidationError> {
        if soft_lower > soft_upper {
            return Err(ValidationError::InvertedBounds {
                field: "soft_lower_bound",
                lower: soft_lower,
                upper: soft_upper,
            });
        }
        self.soft_bounds = Some((soft_lower, soft_upper));
        Ok(self)
    }

    /// Validates the optional bounds of a configuration form. Either both hard
    /// bounds are given, or no bound at all; soft bounds come in pairs.
    pub fn from_bounds(
        lower: Option<f64>,
        upper: Option<f64>,
        soft_lower: Option<f64>,
        soft_upper: Option<f64>,
    ) -> Result<Option<Self>, ValidationError> {
        let check = match (lower, upper) {
            (Some(lower), Some(upper)) => Self::new(lower, upper)?,
            (None, None) if soft_lower.is_none() && soft_upper.is_none() => return Ok(None),
            (None, None) => return Err(ValidationError::SoftBoundsWithoutHardBounds),
            _ => return Err(ValidationError::IncompleteBounds),
        };
        match (soft_lower, soft_upper) {
            (Some(soft_lower), Some(soft_upper)) => check.with_soft_bounds(soft_lower, soft_upper).map(Some),
            (None, None) => Ok(Some(check)),
            _ => Err(ValidationError::IncompleteSoftBounds),
        }
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.lower_bound, self.upper_bound)
    }

    pub fn soft_bounds(&self) -> Option<(f64, f64)> {
        self.soft_bounds
    }

    /// Hard violations are nulled and flagged RANGE; the soft bounds are then
    /// applied to what is left, so a nulled value is never also SUSPECT.
    pub fn check(&self, data: &mut TimeseriesData) {
        let outside = |value: f64, (low, high): (f64, f64)| value < low || value > high;
        let hard = (self.lower_bound, self.upper_bound);
        for i in 0..data.len() {
            let Some(value) = data.values()[i] else {
                continue;
            };
            if outside(value, hard) {
                data.values_mut()[i] = None;
                flags::add(&mut data.flags_mut()[i], flags::RANGE);
            } else if self.soft_bounds.is_some_and(|soft| outside(value, soft)) {
                flags::add(&mut data.flags_mut()[i], flags::SUSPECT);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub delta_t: DeltaT,
    pub allowed_diff: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateOfChangeCheck {
    thresholds: Vec<Threshold>,
    symmetric: bool,
}

impl RateOfChangeCheck {
    pub fn new(mut thresholds: Vec<Threshold>, symmetric: bool) -> Result<Self, ValidationError> {
        if symmetric {
            if let Some(bad) = thresholds.iter().find(|t| t.allowed_diff <= 0.0) {
                return Err(ValidationError::NonPositiveSymmetricThreshold(bad.allowed_diff));
            }
        }
        thresholds.sort_by_key(|t| t.delta_t);
        Ok(Self {
            thresholds,
            symmetric,
        })
    }

    /// Parses lines of `<delta_t> <allowed_diff>` separated by whitespace.
    pub fn parse_thresholds(text: &str) -> Result<Vec<Threshold>, ValidationError> {
        let mut thresholds = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line_number = index + 1;
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (delta_t, allowed_diff) = match fields.as_slice() {
                [] => continue,
                [delta_t, allowed_diff] => (delta_t, allowed_diff),
                _ => {
                    return Err(ValidationError::InvalidThreshold {
                        line: line_number,
                        reason: "expected a delta_t and an allowed difference".to_string(),
                    })
                }
            };
            let allowed_diff = allowed_diff
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite())
                .ok_or_else(|| ValidationError::InvalidThreshold {
                    line: line_number,
                    reason: format!("\"{}\" is not a number", allowed_diff),
                })?;
            thresholds.push(Threshold {
                delta_t: delta_t.parse()?,
                allowed_diff,
            });
        }
        Ok(thresholds)
    }

    pub fn thresholds_as_text(&self) -> String {
        self.thresholds
            .iter()
            .map(|t| format!("{}\t{:?}\n", t.delta_t, t.allowed_diff))
            .collect()
    }

    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    pub fn symmetric(&self) -> bool {
        self.symmetric
    }

    /// Longest window any threshold looks back over.
    pub fn lookback(&self) -> Duration {
        self.thresholds
            .iter()
            .map(|t| t.delta_t.duration())
            .max()
            .unwrap_or_else(Duration::zero)
    }

    fn too_large(&self, diff: f64, allowed: f64) -> bool {
        if self.symmetric {
            diff.abs() > allowed
        } else if allowed >= 0.0 {
            diff > allowed
        } else {
            diff < allowed
        }
    }

    /// Compares each value with the earlier unflagged values in the window.
    fn exceeds(&self, data: &TimeseriesData, index: usize, threshold: &Threshold) -> bool {
        let Some(current) = data.values()[index] else {
            return false;
        };
        // None: the window reaches past the earliest representable time
        let window_start = data.timestamps()[index].checked_sub_signed(threshold.delta_t.duration());
        (0..index)
            .rev()
            .take_while(|&j| window_start.is_none_or(|start| data.timestamps()[j] >= start))
            .filter(|&j| !flags::contains(&data.flags()[j], flags::TEMPORAL))
            .filter_map(|j| data.values()[j])
            .any(|earlier| self.too_large(current - earlier, threshold.allowed_diff))
    }

    pub fn check(&self, data: &mut TimeseriesData) {
        for threshold in &self.thresholds {
            for i in 0..data.len() {
                if flags::contains(&data.flags()[i], flags::TEMPORAL) {
                    continue;
                }
                if self.exceeds(data, i, threshold) {
                    flags::add(&mut data.flags_mut()[i], flags::TEMPORAL);
                }
            }
        }
        for i in 0..data.len() {
            if flags::contains(&data.flags()[i], flags::TEMPORAL) {
                data.values_mut()[i] = None;
            }
        }
    }
}

/// The checks of one group, run in order: range first, then rate of change.
#[derive(Debug, Clone, PartialEq)]
pub struct Checks {
    pub range: Option<RangeCheck>,
    pub rate_of_change: Option<RateOfChangeCheck>,
}

impl Checks {
    pub fn new(range: Option<RangeCheck>, rate_of_change: Option<RateOfChangeCheck>) -> Result<Self, ValidationError> {
        if range.is_none() && rate_of_change.is_none() {
            return Err(ValidationError::NoChecks);
        }
        Ok(Self {
            range,
            rate_of_change,
        })
    }

    pub fn lookback(&self) -> Duration {
        self.rate_of_change
            .as_ref()
            .map_or_else(Duration::zero, RateOfChangeCheck::lookback)
    }
}

impl Processor for Checks {
    fn process(&self, source: &TimeseriesData, _ctx: &ProcessContext) -> Result<TimeseriesData, ProcessError> {
        let mut data = source.clone();
        if let Some(range) = &self.range {
            range.check(&mut data);
        }
        if let Some(rate_of_change) = &self.rate_of_change {
            rate_of_change.check(&mut data);
        }
        Ok(data)
    }
}
