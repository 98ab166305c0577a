// Time step, delta_t and timestamp offset tokens
use super::error::ValidationError;
use chrono::Duration;
use std::fmt;
use std::str::FromStr;

/// Longest window or offset accepted, about the 1678..2261 span records are
/// clamped to. Anything longer can only overflow timestamp arithmetic.
pub const MAX_SPAN_MINUTES: i64 = 584 * 366 * 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Minute,
    Hour,
    Day,
    Month,
    Year,
}

impl TimeUnit {
    fn parse(unit: &str) -> Option<Self> {
        match unit {
            "min" => Some(TimeUnit::Minute),
            "h" | "H" | "hour" => Some(TimeUnit::Hour),
            "D" | "d" | "day" => Some(TimeUnit::Day),
            "M" | "month" => Some(TimeUnit::Month),
            "Y" | "year" => Some(TimeUnit::Year),
            _ => None,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            TimeUnit::Minute => "min",
            TimeUnit::Hour => "h",
            TimeUnit::Day => "D",
            TimeUnit::Month => "M",
            TimeUnit::Year => "Y",
        }
    }
}

/// Nominal time step such as `10min`, `1h`, `1D`, `1M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeStep {
    pub count: u32,
    pub unit: TimeUnit,
}

impl TimeStep {
    pub fn minutes(count: u32) -> Self {
        Self {
            count,
            unit: TimeUnit::Minute,
        }
    }

    /// Length of the step, or `None` for calendar steps (months, years).
    pub fn fixed_duration(&self) -> Option<Duration> {
        let count = i64::from(self.count);
        match self.unit {
            TimeUnit::Minute => Some(Duration::minutes(count)),
            TimeUnit::Hour => Some(Duration::hours(count)),
            TimeUnit::Day => Some(Duration::days(count)),
            TimeUnit::Month | TimeUnit::Year => None,
        }
    }

    /// Length in months for calendar steps.
    pub fn months(&self) -> Option<i64> {
        let count = i64::from(self.count);
        match self.unit {
            TimeUnit::Month => Some(count),
            TimeUnit::Year => Some(count * 12),
            _ => None,
        }
    }
}

impl fmt::Display for TimeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.symbol())
    }
}

impl FromStr for TimeStep {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidTimeStep(s.to_string());
        let (number, unit) = split_number(s);
        let unit = TimeUnit::parse(unit).ok_or_else(invalid)?;
        let count = if number.is_empty() {
            1
        } else {
            number.parse::<u32>().map_err(|_| invalid())?
        };
        if count == 0 {
            return Err(invalid());
        }
        Ok(Self { count, unit })
    }
}

/// Window of a rate-of-change threshold: a positive number of minutes, hours or days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeltaT {
    minutes: i64,
}

impl DeltaT {
    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes)
    }
}

impl fmt::Display for DeltaT {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let minutes = self.minutes;
        if minutes % (24 * 60) == 0 {
            write!(f, "{}D", minutes / (24 * 60))
        } else if minutes % 60 == 0 {
            write!(f, "{}h", minutes / 60)
        } else {
            write!(f, "{}min", minutes)
        }
    }
}

impl FromStr for DeltaT {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidDeltaT(s.to_string());
        let (number, unit) = split_number(s);
        let count: i64 = number.parse().map_err(|_| invalid())?;
        let per_unit = match unit {
            "min" => 1,
            "h" | "hour" => 60,
            "D" | "day" => 24 * 60,
            _ => return Err(invalid()),
        };
        let minutes = count
            .checked_mul(per_unit)
            .filter(|m| (1..=MAX_SPAN_MINUTES).contains(m))
            .ok_or_else(invalid)?;
        Ok(Self { minutes })
    }
}

/// Amount subtracted from aggregated timestamps after the calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampOffset {
    minutes: i64,
}

impl TimestampOffset {
    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes)
    }
}

impl fmt::Display for TimestampOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}min", self.minutes)
    }
}

impl FromStr for TimestampOffset {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidTimestampOffset(s.to_string());
        let (negative, rest) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (number, unit) = split_number(rest);
        if unit != "min" || (negative && number.is_empty()) {
            return Err(invalid());
        }
        let minutes: i64 = if number.is_empty() {
            1
        } else {
            number.parse().map_err(|_| invalid())?
        };
        if minutes > MAX_SPAN_MINUTES {
            return Err(invalid());
        }
        Ok(Self {
            minutes: if negative { -minutes } else { minutes },
        })
    }
}

fn split_number(s: &str) -> (&str, &str) {
    let boundary = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s.split_at(boundary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_step() {
        assert_eq!("10min".parse::<TimeStep>().unwrap(), TimeStep::minutes(10));
        let hourly: TimeStep = "H".parse().unwrap();
        assert_eq!(hourly.fixed_duration(), Some(Duration::hours(1)));
        let monthly: TimeStep = "1M".parse().unwrap();
        assert_eq!(monthly.fixed_duration(), None);
        assert_eq!(monthly.months(), Some(1));
        assert_eq!("2Y".parse::<TimeStep>().unwrap().months(), Some(24));
        assert_eq!("4294967295Y".parse::<TimeStep>().unwrap().months(), Some(4294967295 * 12));
        assert_eq!("1day".parse::<TimeStep>().unwrap().to_string(), "1D");
    }

    #[test]
    fn test_invalid_time_step() {
        let err = "1a".parse::<TimeStep>().unwrap_err();
        assert_eq!(err.to_string(), "\"1a\" is not a valid time step");
        assert!("0min".parse::<TimeStep>().is_err());
        assert!("".parse::<TimeStep>().is_err());
    }

    #[test]
    fn test_delta_t() {
        assert_eq!("1min".parse::<DeltaT>().unwrap().duration(), Duration::minutes(1));
        assert_eq!("2h".parse::<DeltaT>().unwrap().duration(), Duration::hours(2));
        assert_eq!("3D".parse::<DeltaT>().unwrap().duration(), Duration::days(3));
        assert_eq!("60min".parse::<DeltaT>().unwrap().to_string(), "1h");
        let longest = "213744D".parse::<DeltaT>().unwrap();
        assert_eq!(longest.duration(), Duration::minutes(MAX_SPAN_MINUTES));
    }

    #[test]
    fn test_invalid_delta_t() {
        for token in ["garbge", "0min", "2garbg", "min", "1M", "-5min", "100000000D", "9223372036854775807h"] {
            let err = token.parse::<DeltaT>().unwrap_err();
            assert_eq!(err.to_string(), format!("\"{}\" is not a valid delta_t", token));
        }
    }

    #[test]
    fn test_timestamp_offset() {
        assert_eq!("min".parse::<TimestampOffset>().unwrap().duration(), Duration::minutes(1));
        assert_eq!("15min".parse::<TimestampOffset>().unwrap().duration(), Duration::minutes(15));
        assert_eq!("-1min".parse::<TimestampOffset>().unwrap().duration(), Duration::minutes(-1));
        for token in ["hello", "-", "15", "-min", "999999999999999min", "-999999999999999min"] {
            assert!(token.parse::<TimestampOffset>().is_err(), "{}", token);
        }
    }
}
