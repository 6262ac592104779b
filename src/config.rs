use crate::collectors::{DEFAULT_COMMAND_RATE, DEFAULT_FLEET_RATE, MeasurementMethod, validate_rate};
use crate::utils::errors::MonitoringError;
use envconfig::Envconfig;
use log::LevelFilter;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "EMT_POLLING_INTERVAL", default = "1")]
    pub polling_interval: EnvSecsDuration,

    #[envconfig(from = "EMT_MEASUREMENT_METHOD", default = "hardware")]
    pub measurement_method: MeasurementMethod,

    /// Units per second for the simulated strategy. Unset means the
    /// deployment default (MWh/s for the fleet, J/s for a single command).
    #[envconfig(from = "EMT_CONSUMPTION_RATE")]
    pub consumption_rate: Option<f64>,

    #[envconfig(from = "EMT_MAX_EXECUTION_TIME", default = "3600")]
    pub max_execution_time: EnvSecsDuration,

    /// Where final reports are written. Nothing is persisted when unset.
    #[envconfig(from = "EMT_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    #[envconfig(from = "EMT_LOG_LEVEL", default = "info")]
    pub log_level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            polling_interval: EnvSecsDuration(Duration::from_secs(1)),
            measurement_method: MeasurementMethod::Hardware,
            consumption_rate: None,
            max_execution_time: EnvSecsDuration(Duration::from_secs(3600)),
            output_dir: None,
            log_level: LevelFilter::Info,
        }
    }
}

/// Values supplied on the command line; `None` keeps the environment value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub polling_interval: Option<f64>,
    pub measurement_method: Option<MeasurementMethod>,
    pub consumption_rate: Option<f64>,
    pub max_execution_time: Option<f64>,
    pub output_dir: Option<PathBuf>,
}

impl Config {
    /// Read `EMT_*` variables and validate the result.
    pub fn load() -> Result<Self, MonitoringError> {
        let config = Self::init_from_env().map_err(|e| MonitoringError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(vars: &HashMap<String, String>) -> Result<Self, MonitoringError> {
        let config = Self::init_from_hashmap(vars).map_err(|e| MonitoringError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply(mut self, overrides: Overrides) -> Result<Self, MonitoringError> {
        if let Some(secs) = overrides.polling_interval {
            self.polling_interval = EnvSecsDuration::from_secs_f64(secs)?;
        }
        if let Some(method) = overrides.measurement_method {
            self.measurement_method = method;
        }
        if let Some(rate) = overrides.consumption_rate {
            self.consumption_rate = Some(rate);
        }
        if let Some(secs) = overrides.max_execution_time {
            self.max_execution_time = EnvSecsDuration::from_secs_f64(secs)?;
        }
        if let Some(dir) = overrides.output_dir {
            self.output_dir = Some(dir);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), MonitoringError> {
        if self.polling_interval.0.is_zero() {
            return Err(MonitoringError::InvalidConfig(
                "polling interval must be greater than zero".to_string(),
            ));
        }
        if let Some(rate) = self.consumption_rate {
            validate_rate(rate)?;
        }
        Ok(())
    }

    pub fn fleet_rate(&self) -> f64 {
        self.consumption_rate.unwrap_or(DEFAULT_FLEET_RATE)
    }

    pub fn command_rate(&self) -> f64 {
        self.consumption_rate.unwrap_or(DEFAULT_COMMAND_RATE)
    }
}

/// Duration given in (possibly fractional) seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvSecsDuration(pub Duration);

impl EnvSecsDuration {
    pub fn from_secs_f64(secs: f64) -> Result<Self, MonitoringError> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(MonitoringError::InvalidConfig(format!(
                "duration must be a non-negative number of seconds, got {}",
                secs
            )));
        }
        Duration::try_from_secs_f64(secs)
            .map(EnvSecsDuration)
            .map_err(|e| MonitoringError::InvalidConfig(format!("duration of {} seconds is out of range: {}", secs, e)))
    }
}

impl FromStr for EnvSecsDuration {
    type Err = MonitoringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s
            .trim()
            .parse::<f64>()
            .map_err(|_| MonitoringError::InvalidConfig(format!("'{}' is not a number of seconds", s)))?;
        Self::from_secs_f64(secs)
    }
}
