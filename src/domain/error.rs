// Error taxonomy for storage, configuration and processing
use super::station::{GroupId, StationId};
use super::timeseries::TimeseriesId;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub type RuleId = i64;

/// Errors raised by the record store and the time series façade.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "cannot append time series {timeseries_id}: its first record ({new_start}) is not \
         later than the last record ({last}) of the time series to append to"
    )]
    OutOfOrderAppend {
        timeseries_id: TimeseriesId,
        new_start: DateTime<Utc>,
        last: DateTime<Utc>,
    },
    #[error("time series {timeseries_id} already has a record at {timestamp}")]
    DuplicateTimestamp {
        timeseries_id: TimeseriesId,
        timestamp: DateTime<Utc>,
    },
    #[error("line {line}: malformed timestamp {text:?}")]
    MalformedTimestamp { line: usize, text: String },
    #[error("line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },
    #[error("time series {0} does not exist")]
    TimeseriesNotFound(TimeseriesId),
    #[error("time series group {0} does not exist")]
    GroupNotFound(GroupId),
    #[error("station {0} does not exist")]
    StationNotFound(StationId),
    #[error("group {group_id} already has a time series matching {key}")]
    UniqueViolation { group_id: GroupId, key: String },
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(error: impl std::fmt::Display) -> Self {
        StoreError::Backend(error.to_string())
    }
}

/// Configuration-time validation errors, reported per field.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("lower and upper bound must be specified together")]
    IncompleteBounds,
    #[error("soft lower and soft upper bound must be specified together")]
    IncompleteSoftBounds,
    #[error("soft bounds require the lower and upper bound to be specified")]
    SoftBoundsWithoutHardBounds,
    #[error("lower bound {lower} is greater than upper bound {upper}")]
    InvertedBounds { field: &'static str, lower: f64, upper: f64 },
    #[error("\"{0}\" is not a valid time step")]
    InvalidTimeStep(String),
    #[error("\"{0}\" is not a valid delta_t")]
    InvalidDeltaT(String),
    #[error("\"{0}\" is not a valid resulting time step offset")]
    InvalidTimestampOffset(String),
    #[error("line {line}: {reason}")]
    InvalidThreshold { line: usize, reason: String },
    #[error("allowed differences of a symmetric check must be positive, got {0}")]
    NonPositiveSymmetricThreshold(f64),
    #[error("line {line}: {reason}")]
    InvalidCurvePoint { line: usize, reason: String },
    #[error("curve period {start} - {end} has no calibration points")]
    EmptyCurve { start: String, end: String },
    #[error("curve period {start} - {end} has more than one point with x = {x}")]
    DuplicateCurveX { start: String, end: String, x: f64 },
    #[error("curve period starting {start} ends before it starts")]
    InvertedPeriod { start: String },
    #[error("curve periods {first} and {second} overlap")]
    OverlappingPeriods { first: String, second: String },
    #[error("a checks rule needs at least one check")]
    NoChecks,
    #[error("unknown aggregation method \"{0}\"")]
    UnknownMethod(String),
}

impl ValidationError {
    /// Name of the configuration field the error is attached to.
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::IncompleteBounds => "lower_bound",
            ValidationError::IncompleteSoftBounds => "soft_lower_bound",
            ValidationError::SoftBoundsWithoutHardBounds => "soft_lower_bound",
            ValidationError::InvertedBounds { field, .. } => field,
            ValidationError::InvalidTimeStep(_) => "time_step",
            ValidationError::InvalidDeltaT(_) => "thresholds",
            ValidationError::InvalidTimestampOffset(_) => "resulting_timestamp_offset",
            ValidationError::InvalidThreshold { .. } => "thresholds",
            ValidationError::NonPositiveSymmetricThreshold(_) => "thresholds",
            ValidationError::InvalidCurvePoint { .. } => "points",
            ValidationError::EmptyCurve { .. } => "points",
            ValidationError::DuplicateCurveX { .. } => "points",
            ValidationError::InvertedPeriod { .. } => "end_date",
            ValidationError::OverlappingPeriods { .. } => "start_date",
            ValidationError::NoChecks => "checks",
            ValidationError::UnknownMethod(_) => "method",
        }
    }
}

/// Errors raised while computing the output of a rule.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("need at least {needed} points to infer the time step, got {got}")]
    InsufficientData { needed: usize, got: usize },
    #[error(
        "The time step is malformed or is specified in months. Only time steps \
         specified in minutes, hours or days are supported."
    )]
    UnsupportedSourceStep,
    #[error("target time step {target} is not a multiple of source time step {source_step}")]
    IncompatibleSteps { source_step: String, target: String },
    #[error("numeric overflow while computing {0}")]
    Overflow(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProcessError {
    /// Expected conditions that are logged and skipped; the next source
    /// extension retries naturally.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProcessError::InsufficientData { .. }
                | ProcessError::UnsupportedSourceStep
                | ProcessError::IncompatibleSteps { .. }
                | ProcessError::Overflow(_)
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            ProcessError::InsufficientData { .. } => "InsufficientData",
            ProcessError::UnsupportedSourceStep => "UnsupportedSourceStep",
            ProcessError::IncompatibleSteps { .. } => "IncompatibleSteps",
            ProcessError::Overflow(_) => "Overflow",
            ProcessError::Store(_) => "StoreError",
        }
    }
}

/// A failed rule execution, as delivered on the dispatcher failure channel.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{kind} while executing auto process with id={rule_id}: {source}", kind = .source.kind())]
    Failed {
        rule_id: RuleId,
        #[source]
        source: ProcessError,
    },
    #[error("auto process with id={rule_id} did not finish within {timeout:?}")]
    TimedOut { rule_id: RuleId, timeout: Duration },
    #[error("auto process with id={0} does not exist")]
    UnknownRule(RuleId),
    #[error("auto process with id={rule_id} panicked: {message}")]
    Panicked { rule_id: RuleId, message: String },
}

impl ExecutionError {
    pub fn rule_id(&self) -> RuleId {
        match self {
            ExecutionError::Failed { rule_id, .. } => *rule_id,
            ExecutionError::TimedOut { rule_id, .. } => *rule_id,
            ExecutionError::UnknownRule(rule_id) => *rule_id,
            ExecutionError::Panicked { rule_id, .. } => *rule_id,
        }
    }
}
