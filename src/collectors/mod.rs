pub mod rapl;

pub use rapl::Rapl;

use crate::utils::errors::MonitoringError;
use crate::utils::logger::LogSink;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default simulated draw for the process fleet monitor, in MWh per second.
pub const DEFAULT_FLEET_RATE: f64 = 1.3889e-8;
/// Default simulated draw for the single command runner, in Joules per second.
pub const DEFAULT_COMMAND_RATE: f64 = 50.0;

/// Average draw assumed for a fully busy CPU when estimating from CPU time, in Watts.
pub const CPU_TIME_WATTS: f64 = 50.0;

const JOULES_PER_MWH: f64 = 3.6e9;

/// Energy estimate for `cpu_time` of user + kernel CPU time at `CPU_TIME_WATTS`.
pub fn cpu_time_energy(cpu_time: Duration, unit: EnergyUnit) -> f64 {
    unit.from_joules(cpu_time.as_secs_f64() * CPU_TIME_WATTS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyUnit {
    Joules,
    MegawattHours,
}

impl EnergyUnit {
    pub fn from_joules(self, joules: f64) -> f64 {
        match self {
            EnergyUnit::Joules => joules,
            EnergyUnit::MegawattHours => joules / JOULES_PER_MWH,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            EnergyUnit::Joules => "J",
            EnergyUnit::MegawattHours => "MWh",
        }
    }
}

impl fmt::Display for EnergyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementMethod {
    Hardware,
    Simulated,
}

impl FromStr for MeasurementMethod {
    type Err = MonitoringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hardware" | "rapl" => Ok(MeasurementMethod::Hardware),
            "simulated" | "dummy" => Ok(MeasurementMethod::Simulated),
            other => Err(MonitoringError::InvalidConfig(format!(
                "unknown measurement method '{}', expected 'hardware' or 'simulated'",
                other
            ))),
        }
    }
}

impl fmt::Display for MeasurementMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementMethod::Hardware => f.write_str("hardware"),
            MeasurementMethod::Simulated => f.write_str("simulated"),
        }
    }
}

/// Opaque reading of a cumulative hardware counter, one value per domain in µJ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSample(pub Vec<u64>);

/// Cumulative energy counter provided by the platform.
pub trait EnergyCounter: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Read the current counter values.
    fn sample(&self) -> Result<CounterSample, MonitoringError>;

    /// Joules consumed between two samples, accounting for counter wrap-around.
    fn joules_between(&self, begin: &CounterSample, end: &CounterSample) -> f64;

    /// Check if this counter type is available on the system
    fn is_available() -> bool
    where
        Self: Sized;
}

/// How an `AccrualMonitor` turns a start/stop bracket into energy.
#[derive(Clone)]
pub enum MeasurementStrategy {
    /// Elapsed wall time multiplied by a fixed rate (units per second).
    Simulated { rate: f64 },
    /// Delegates to a platform energy counter.
    Hardware { counter: Arc<dyn EnergyCounter> },
}

impl fmt::Debug for MeasurementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementStrategy::Simulated { rate } => {
                f.debug_struct("Simulated").field("rate", rate).finish()
            }
            MeasurementStrategy::Hardware { counter } => {
                f.debug_struct("Hardware").field("counter", &counter.name()).finish()
            }
        }
    }
}

pub fn validate_rate(rate: f64) -> Result<f64, MonitoringError> {
    if !rate.is_finite() || rate < 0.0 {
        return Err(MonitoringError::InvalidConfig(format!(
            "consumption rate must be a finite, non-negative number, got {}",
            rate
        )));
    }
    Ok(rate)
}

impl MeasurementStrategy {
    pub fn simulated(rate: f64) -> Result<Self, MonitoringError> {
        Ok(MeasurementStrategy::Simulated {
            rate: validate_rate(rate)?,
        })
    }

    pub fn hardware(counter: Arc<dyn EnergyCounter>) -> Self {
        MeasurementStrategy::Hardware { counter }
    }

    /// Pick the strategy for `method`, probing the RAPL counters once.
    ///
    /// Only an invalid `rate` is an error. A missing or unreadable hardware
    /// facility degrades to the simulated strategy.
    pub fn resolve(method: MeasurementMethod, rate: f64, logger: &LogSink) -> Result<Self, MonitoringError> {
        Self::resolve_with(method, rate, logger, || {
            if !Rapl::is_available() {
                return Err(MonitoringError::CollectorUnavailable(format!(
                    "no RAPL package counter under {}",
                    rapl::DEFAULT_RAPL_ROOT
                )));
            }
            Rapl::discover(rapl::DEFAULT_RAPL_ROOT).map(|rapl| Arc::new(rapl) as Arc<dyn EnergyCounter>)
        })
    }

    /// Same as `resolve` with an injectable hardware probe.
    pub fn resolve_with<P>(
        method: MeasurementMethod,
        rate: f64,
        logger: &LogSink,
        probe: P,
    ) -> Result<Self, MonitoringError>
    where
        P: FnOnce() -> Result<Arc<dyn EnergyCounter>, MonitoringError>,
    {
        let rate = validate_rate(rate)?;
        if method == MeasurementMethod::Simulated {
            return Ok(MeasurementStrategy::Simulated { rate });
        }

        match probe() {
            Ok(counter) => {
                logger.info(format!("Using hardware energy counter '{}'", counter.name()));
                Ok(MeasurementStrategy::Hardware { counter })
            }
            Err(e) => {
                logger.warn(format!(
                    "Hardware energy counter unavailable ({}), falling back to simulated rate {}",
                    e, rate
                ));
                Ok(MeasurementStrategy::Simulated { rate })
            }
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, MeasurementStrategy::Hardware { .. })
    }

    pub fn rate(&self) -> Option<f64> {
        match self {
            MeasurementStrategy::Simulated { rate } => Some(*rate),
            MeasurementStrategy::Hardware { .. } => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Counter driven by the test; each `sample` returns the next queued value.
    pub struct FakeCounter {
        pub values: Mutex<Vec<u64>>,
        pub fail: AtomicBool,
    }

    impl FakeCounter {
        pub fn new(values: Vec<u64>) -> Self {
            Self {
                values: Mutex::new(values),
                fail: AtomicBool::new(false),
            }
        }
    }

    impl EnergyCounter for FakeCounter {
        fn name(&self) -> &str {
            "fake"
        }

        fn sample(&self) -> Result<CounterSample, MonitoringError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(MonitoringError::CounterRead("fake failure".to_string()));
            }
            let mut values = self.values.lock().unwrap();
            let value = if values.len() > 1 { values.remove(0) } else { values[0] };
            Ok(CounterSample(vec![value]))
        }

        fn joules_between(&self, begin: &CounterSample, end: &CounterSample) -> f64 {
            (end.0[0] - begin.0[0]) as f64 / 1e6
        }

        fn is_available() -> bool {
            true
        }
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(EnergyUnit::Joules.from_joules(12.5), 12.5);
        assert!((EnergyUnit::MegawattHours.from_joules(3.6e9) - 1.0).abs() < 1e-12);
        assert_eq!(EnergyUnit::MegawattHours.to_string(), "MWh");
    }

    #[test]
    fn test_cpu_time_energy() {
        assert!((cpu_time_energy(Duration::from_secs(2), EnergyUnit::Joules) - 100.0).abs() < 1e-9);
        assert!((cpu_time_energy(Duration::from_secs(72), EnergyUnit::MegawattHours) - 1e-6).abs() < 1e-15);
        assert_eq!(cpu_time_energy(Duration::ZERO, EnergyUnit::Joules), 0.0);
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("hardware".parse::<MeasurementMethod>().unwrap(), MeasurementMethod::Hardware);
        assert_eq!(" Simulated ".parse::<MeasurementMethod>().unwrap(), MeasurementMethod::Simulated);
        assert!(matches!(
            "psutil".parse::<MeasurementMethod>(),
            Err(MonitoringError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_negative_rate_rejected() {
        assert!(matches!(
            MeasurementStrategy::simulated(-1.0),
            Err(MonitoringError::InvalidConfig(_))
        ));
        assert!(MeasurementStrategy::simulated(f64::NAN).is_err());
        assert!(MeasurementStrategy::simulated(0.0).is_ok());
    }

    #[test]
    fn test_resolve_falls_back_when_hardware_missing() {
        let logger = LogSink::new("test");
        let strategy = MeasurementStrategy::resolve_with(MeasurementMethod::Hardware, 2.0, &logger, || {
            Err(MonitoringError::CollectorUnavailable("no powercap".to_string()))
        })
        .unwrap();
        assert!(!strategy.is_hardware());
        assert_eq!(strategy.rate(), Some(2.0));
    }

    #[test]
    fn test_resolve_uses_hardware_when_present() {
        let logger = LogSink::new("test");
        let strategy = MeasurementStrategy::resolve_with(MeasurementMethod::Hardware, 2.0, &logger, || {
            Ok(Arc::new(FakeCounter::new(vec![0])) as Arc<dyn EnergyCounter>)
        })
        .unwrap();
        assert!(strategy.is_hardware());
        assert_eq!(strategy.rate(), None);
    }

    #[test]
    fn test_resolve_simulated_skips_probe() {
        let logger = LogSink::new("test");
        let strategy = MeasurementStrategy::resolve_with(MeasurementMethod::Simulated, 1.0, &logger, || {
            panic!("hardware must not be probed")
        })
        .unwrap();
        assert!(!strategy.is_hardware());
    }

    #[test]
    fn test_resolve_rejects_negative_rate_even_with_hardware() {
        let logger = LogSink::new("test");
        let result = MeasurementStrategy::resolve_with(MeasurementMethod::Hardware, -3.0, &logger, || {
            Ok(Arc::new(FakeCounter::new(vec![0])) as Arc<dyn EnergyCounter>)
        });
        assert!(matches!(result, Err(MonitoringError::InvalidConfig(_))));
    }
}
