// Service settings and the pipeline bootstrap document
use crate::application::autoprocess::aggregation::{Aggregation, AggregationMethod};
use crate::application::autoprocess::checks::{Checks, RangeCheck, RateOfChangeCheck};
use crate::application::autoprocess::curve::{CurveInterpolation, CurvePeriod};
use crate::application::autoprocess::registry::RuleRegistry;
use crate::application::autoprocess::{AutoProcess, RuleKind};
use crate::application::catalog::Catalog;
use crate::domain::error::{RuleId, ValidationError};
use crate::domain::station::{DisplayTimezone, GroupId, Location, Station, StationId, TimeseriesGroup};
use chrono::NaiveDate;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub dispatcher: DispatcherSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Influx,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub influx: Option<InfluxSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InfluxSettings {
    pub host: String,
    pub token: String,
    pub database: String,
    pub retention_policy: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DispatcherSettings {
    pub workers: usize,
    pub execution_timeout_secs: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            execution_timeout_secs: 300,
        }
    }
}

impl DispatcherSettings {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

/// `config/hydro.toml` if present, overridden by `HYDRO_SECTION__KEY` variables.
pub fn load_app_config() -> anyhow::Result<AppConfig> {
    build_app_config(config::Environment::with_prefix("HYDRO"))
}

fn build_app_config(environment: config::Environment) -> anyhow::Result<AppConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/hydro").required(false))
        .add_source(
            environment
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

pub fn load_pipeline_config() -> anyhow::Result<PipelineConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/pipeline").required(false))
        .build()?;

    Ok(settings.try_deserialize()?)
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub stations: Vec<StationConfig>,
    pub groups: Vec<GroupConfig>,
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StationConfig {
    pub id: StationId,
    pub name: String,
    pub location: Option<Location>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GroupConfig {
    pub id: GroupId,
    pub station_id: StationId,
    pub variable: String,
    pub unit_symbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_precision")]
    pub precision: i32,
    pub time_zone: DisplayTimezone,
    #[serde(default)]
    pub remarks: String,
    #[serde(default)]
    pub hidden: bool,
}

fn default_precision() -> i32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuleConfig {
    pub id: RuleId,
    pub group_id: GroupId,
    #[serde(flatten)]
    pub params: RuleParams,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleParams {
    Checks {
        lower_bound: Option<f64>,
        upper_bound: Option<f64>,
        soft_lower_bound: Option<f64>,
        soft_upper_bound: Option<f64>,
        /// One `<delta_t>\t<allowed_diff>` pair per line.
        #[serde(default)]
        thresholds: String,
        #[serde(default)]
        symmetric: bool,
    },
    CurveInterpolation {
        target_group_id: GroupId,
        #[serde(default)]
        periods: Vec<CurvePeriodConfig>,
    },
    Aggregation {
        target_time_step: String,
        method: AggregationMethod,
        #[serde(default)]
        max_missing: u32,
        resulting_timestamp_offset: Option<String>,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct CurvePeriodConfig {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// One `x,y` or `x<TAB>y` pair per line.
    pub points: String,
}

/// A rule that failed validation, reported against the offending field.
#[derive(Debug, Error)]
#[error("auto process {rule_id}, field {field}: {source}", field = .source.field())]
pub struct RuleConfigError {
    pub rule_id: RuleId,
    #[source]
    pub source: ValidationError,
}

impl RuleConfig {
    pub fn to_rule(&self) -> Result<AutoProcess, RuleConfigError> {
        let kind = self.params.to_kind().map_err(|source| RuleConfigError {
            rule_id: self.id,
            source,
        })?;
        Ok(AutoProcess::new(self.id, self.group_id, kind))
    }
}

impl RuleParams {
    fn to_kind(&self) -> Result<RuleKind, ValidationError> {
        match self {
            RuleParams::Checks {
                lower_bound,
                upper_bound,
                soft_lower_bound,
                soft_upper_bound,
                thresholds,
                symmetric,
            } => {
                let range = RangeCheck::from_bounds(*lower_bound, *upper_bound, *soft_lower_bound, *soft_upper_bound)?;
                let thresholds = RateOfChangeCheck::parse_thresholds(thresholds)?;
                let rate_of_change = if thresholds.is_empty() {
                    None
                } else {
                    Some(RateOfChangeCheck::new(thresholds, *symmetric)?)
                };
                Ok(RuleKind::Checks(Checks::new(range, rate_of_change)?))
            }
            RuleParams::CurveInterpolation {
                target_group_id,
                periods,
            } => {
                let periods = periods
                    .iter()
                    .map(|p| CurvePeriod::new(p.start_date, p.end_date, CurvePeriod::parse_points(&p.points)?))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(RuleKind::CurveInterpolation(CurveInterpolation::new(*target_group_id, periods)?))
            }
            RuleParams::Aggregation {
                target_time_step,
                method,
                max_missing,
                resulting_timestamp_offset,
            } => Ok(RuleKind::Aggregation(Aggregation::new(
                target_time_step,
                *method,
                *max_missing,
                resulting_timestamp_offset.as_deref(),
            )?)),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads stations and groups into the catalog and validated rules into the
    /// registry. Nothing is registered if any rule is invalid.
    pub fn apply(&self, catalog: &Catalog, registry: &RuleRegistry) -> anyhow::Result<()> {
        let rules = self
            .rules
            .iter()
            .map(RuleConfig::to_rule)
            .collect::<Result<Vec<_>, _>>()?;

        for station in &self.stations {
            catalog.add_station(Station {
                id: station.id,
                name: station.name.clone(),
                location: station.location.clone(),
            });
        }
        for group in &self.groups {
            catalog.add_group(TimeseriesGroup {
                id: group.id,
                station_id: group.station_id,
                variable: group.variable.clone(),
                unit_symbol: group.unit_symbol.clone(),
                name: group.name.clone(),
                precision: group.precision,
                time_zone: group.time_zone.clone(),
                remarks: group.remarks.clone(),
                hidden: group.hidden,
            })?;
        }
        for rule in rules {
            tracing::info!(rule_id = rule.id, group_id = rule.group_id, "registered auto process");
            registry.insert(rule);
        }
        Ok(())
    }
}
