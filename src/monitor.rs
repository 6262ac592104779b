use crate::collectors::{CounterSample, EnergyUnit, MeasurementStrategy};
use crate::utils::logger::LogSink;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Time source for monitors. Only differences between two readings matter.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn advance_secs_f64(&self, secs: f64) {
        self.advance(chrono::Duration::nanoseconds((secs * 1e9).round() as i64));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Stopped,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorState::Idle => f.write_str("idle"),
            MonitorState::Running => f.write_str("running"),
            MonitorState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Seconds between two instants, never negative.
fn elapsed_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let delta = end - start;
    let secs = match delta.num_nanoseconds() {
        Some(ns) => ns as f64 / 1e9,
        None => delta.num_milliseconds() as f64 / 1e3,
    };
    secs.max(0.0)
}

/// Energy monitor for one entity: a single start/stop bracket.
///
/// Idle -> Running -> Stopped, each transition at most once. A stopped monitor
/// reports a settled value computed from its recorded bracket; a running one
/// only ever reports a projection.
pub struct AccrualMonitor {
    label: String,
    strategy: MeasurementStrategy,
    unit: EnergyUnit,
    clock: Arc<dyn Clock>,
    logger: LogSink,
    state: MonitorState,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    /// Hardware counter reading taken at start
    begin_sample: Option<CounterSample>,
    /// Hardware energy settled at stop, `None` if a counter read failed
    hardware_energy: Option<f64>,
}

impl AccrualMonitor {
    pub fn new(
        label: impl Into<String>,
        strategy: MeasurementStrategy,
        unit: EnergyUnit,
        clock: Arc<dyn Clock>,
        logger: LogSink,
    ) -> Self {
        Self {
            label: label.into(),
            strategy,
            unit,
            clock,
            logger,
            state: MonitorState::Idle,
            start_time: None,
            end_time: None,
            begin_sample: None,
            hardware_energy: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn unit(&self) -> EnergyUnit {
        self.unit
    }

    pub fn strategy(&self) -> &MeasurementStrategy {
        &self.strategy
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Begin measuring. Returns `false` (and changes nothing) unless Idle.
    pub fn start(&mut self) -> bool {
        if self.state != MonitorState::Idle {
            self.logger.warn(format!(
                "Monitor '{}' already {}, ignoring start",
                self.label, self.state
            ));
            return false;
        }

        if let MeasurementStrategy::Hardware { counter } = &self.strategy {
            match counter.sample() {
                Ok(sample) => self.begin_sample = Some(sample),
                Err(e) => self.logger.warn(format!(
                    "Monitor '{}' could not read {} counter at start: {}",
                    self.label,
                    counter.name(),
                    e
                )),
            }
        }

        self.start_time = Some(self.clock.now());
        self.state = MonitorState::Running;
        self.logger.debug(format!("Monitor '{}' started", self.label));
        true
    }

    /// Finish measuring. Returns `false` (and changes nothing) unless Running.
    pub fn stop(&mut self) -> bool {
        if self.state != MonitorState::Running {
            self.logger.warn(format!(
                "Monitor '{}' is {}, nothing to stop",
                self.label, self.state
            ));
            return false;
        }

        if let MeasurementStrategy::Hardware { counter } = &self.strategy {
            self.hardware_energy = match (&self.begin_sample, counter.sample()) {
                (Some(begin), Ok(end)) => Some(self.unit.from_joules(counter.joules_between(begin, &end))),
                (None, _) => None,
                (Some(_), Err(e)) => {
                    self.logger.warn(format!(
                        "Monitor '{}' could not read {} counter at stop: {}",
                        self.label,
                        counter.name(),
                        e
                    ));
                    None
                }
            };
        }

        self.end_time = Some(self.clock.now());
        self.state = MonitorState::Stopped;
        self.logger.debug(format!("Monitor '{}' stopped", self.label));
        true
    }

    /// Settled value when Stopped, live projection when Running, `None` when
    /// Idle or when the measurement is unavailable.
    pub fn energy(&self) -> Option<f64> {
        match self.state {
            MonitorState::Idle => None,
            MonitorState::Running => self.projected_energy(),
            MonitorState::Stopped => self.final_energy(),
        }
    }

    /// The settled value. `None` unless the monitor is Stopped.
    pub fn final_energy(&self) -> Option<f64> {
        if self.state != MonitorState::Stopped {
            return None;
        }
        match &self.strategy {
            MeasurementStrategy::Simulated { rate } => {
                let (start, end) = (self.start_time?, self.end_time?);
                Some(elapsed_secs(start, end) * rate)
            }
            MeasurementStrategy::Hardware { .. } => self.hardware_energy,
        }
    }

    /// Consumption so far for a running monitor. Never mutates state.
    pub fn projected_energy(&self) -> Option<f64> {
        if self.state != MonitorState::Running {
            return None;
        }
        match &self.strategy {
            MeasurementStrategy::Simulated { rate } => {
                let start = self.start_time?;
                Some(elapsed_secs(start, self.clock.now()) * rate)
            }
            MeasurementStrategy::Hardware { counter } => {
                let begin = self.begin_sample.as_ref()?;
                let now = counter.sample().ok()?;
                Some(self.unit.from_joules(counter.joules_between(begin, &now)))
            }
        }
    }

    /// Start the monitor and stop it when the returned guard goes away.
    pub fn scoped(&mut self) -> MonitorGuard<'_> {
        self.start();
        MonitorGuard { monitor: self }
    }
}

impl fmt::Debug for AccrualMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccrualMonitor")
            .field("label", &self.label)
            .field("strategy", &self.strategy)
            .field("unit", &self.unit)
            .field("state", &self.state)
            .field("start_time", &self.start_time)
            .field("end_time", &self.end_time)
            .finish()
    }
}

/// Keeps a monitor running for the guard's lifetime.
pub struct MonitorGuard<'a> {
    monitor: &'a mut AccrualMonitor,
}

impl MonitorGuard<'_> {
    pub fn monitor(&self) -> &AccrualMonitor {
        self.monitor
    }

    /// Stop now and return the settled value.
    pub fn finish(self) -> Option<f64> {
        self.monitor.stop();
        self.monitor.final_energy()
    }
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        if self.monitor.state() == MonitorState::Running {
            self.monitor.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::EnergyCounter;
    use crate::collectors::tests::FakeCounter;
    use rand::Rng;
    use std::sync::atomic::Ordering;

    fn simulated(rate: f64, clock: &Arc<ManualClock>) -> AccrualMonitor {
        AccrualMonitor::new(
            "test",
            MeasurementStrategy::simulated(rate).unwrap(),
            EnergyUnit::Joules,
            clock.clone(),
            LogSink::new("test"),
        )
    }

    #[test]
    fn test_energy_only_settled_when_stopped() {
        let clock = Arc::new(ManualClock::default());
        let mut monitor = simulated(2.0, &clock);
        assert_eq!(monitor.energy(), None);
        assert_eq!(monitor.final_energy(), None);

        assert!(monitor.start());
        clock.advance(chrono::Duration::seconds(3));
        assert_eq!(monitor.final_energy(), None);
        assert!((monitor.projected_energy().unwrap() - 6.0).abs() < 1e-9);

        assert!(monitor.stop());
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!((monitor.final_energy().unwrap() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_stopped_value_does_not_follow_clock() {
        let clock = Arc::new(ManualClock::default());
        let mut monitor = simulated(1.5, &clock);
        monitor.start();
        clock.advance(chrono::Duration::seconds(2));
        monitor.stop();
        let settled = monitor.energy();
        clock.advance(chrono::Duration::seconds(100));
        assert_eq!(monitor.energy(), settled);
    }

    #[test]
    fn test_projection_does_not_mutate() {
        let clock = Arc::new(ManualClock::default());
        let mut monitor = simulated(1.0, &clock);
        monitor.start();
        clock.advance(chrono::Duration::seconds(1));
        let _ = monitor.projected_energy();
        let _ = monitor.energy();
        assert_eq!(monitor.state(), MonitorState::Running);
        assert_eq!(monitor.end_time(), None);
    }

    #[test]
    fn test_double_start_and_stop_are_noops() {
        let clock = Arc::new(ManualClock::default());
        let mut monitor = simulated(1.0, &clock);
        assert!(!monitor.stop());
        assert_eq!(monitor.state(), MonitorState::Idle);

        assert!(monitor.start());
        let started = monitor.start_time();
        clock.advance(chrono::Duration::seconds(1));
        assert!(!monitor.start());
        assert_eq!(monitor.start_time(), started);

        assert!(monitor.stop());
        let ended = monitor.end_time();
        let settled = monitor.energy();
        clock.advance(chrono::Duration::seconds(5));
        assert!(!monitor.stop());
        assert_eq!(monitor.end_time(), ended);
        assert_eq!(monitor.energy(), settled);
        assert!(!monitor.start());
    }

    #[test]
    fn test_zero_rate_reports_zero() {
        let clock = Arc::new(ManualClock::default());
        let mut monitor = simulated(0.0, &clock);
        monitor.start();
        clock.advance(chrono::Duration::seconds(10));
        monitor.stop();
        assert_eq!(monitor.energy(), Some(0.0));
    }

    #[test]
    fn test_energy_matches_rate_times_elapsed() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let rate: f64 = rng.gen_range(0.0..1000.0);
            let elapsed: f64 = rng.gen_range(0.0..10_000.0);
            let clock = Arc::new(ManualClock::default());
            let mut monitor = simulated(rate, &clock);
            monitor.start();
            clock.advance_secs_f64(elapsed);
            monitor.stop();

            let expected = rate * elapsed;
            let actual = monitor.energy().unwrap();
            let tolerance = 1e-9 * expected.abs().max(1.0);
            assert!(
                (actual - expected).abs() <= tolerance,
                "rate={} elapsed={} expected={} actual={}",
                rate,
                elapsed,
                expected,
                actual
            );
        }
    }

    #[test]
    fn test_mwh_default_rate_for_one_hour() {
        let clock = Arc::new(ManualClock::default());
        let mut monitor = AccrualMonitor::new(
            "fleet",
            MeasurementStrategy::simulated(crate::collectors::DEFAULT_FLEET_RATE).unwrap(),
            EnergyUnit::MegawattHours,
            clock.clone(),
            LogSink::new("test"),
        );
        monitor.start();
        clock.advance(chrono::Duration::hours(1));
        monitor.stop();
        assert!((monitor.energy().unwrap() - 5.00004e-5).abs() < 1e-12);
    }

    #[test]
    fn test_hardware_strategy_reads_counter_bracket() {
        let counter = Arc::new(FakeCounter::new(vec![1_000_000, 4_000_000, 7_000_000]));
        let clock = Arc::new(ManualClock::default());
        let mut monitor = AccrualMonitor::new(
            "hw",
            MeasurementStrategy::hardware(counter.clone() as Arc<dyn EnergyCounter>),
            EnergyUnit::Joules,
            clock.clone(),
            LogSink::new("test"),
        );
        monitor.start();
        assert!((monitor.projected_energy().unwrap() - 3.0).abs() < 1e-9);
        monitor.stop();
        assert!((monitor.energy().unwrap() - 6.0).abs() < 1e-9);
        // settled value no longer touches the counter
        counter.fail.store(true, Ordering::Relaxed);
        assert!((monitor.energy().unwrap() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_hardware_read_failure_is_unavailable() {
        let counter = Arc::new(FakeCounter::new(vec![0]));
        let clock = Arc::new(ManualClock::default());
        let mut monitor = AccrualMonitor::new(
            "hw",
            MeasurementStrategy::hardware(counter.clone() as Arc<dyn EnergyCounter>),
            EnergyUnit::Joules,
            clock.clone(),
            LogSink::new("test"),
        );
        monitor.start();
        counter.fail.store(true, Ordering::Relaxed);
        assert_eq!(monitor.projected_energy(), None);
        assert!(monitor.stop());
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert_eq!(monitor.energy(), None);
    }

    #[test]
    fn test_scoped_guard_stops_on_drop() {
        let clock = Arc::new(ManualClock::default());
        let mut monitor = simulated(4.0, &clock);
        {
            let guard = monitor.scoped();
            assert_eq!(guard.monitor().state(), MonitorState::Running);
            clock.advance(chrono::Duration::milliseconds(500));
        }
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!((monitor.energy().unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_scoped_guard_finish() {
        let clock = Arc::new(ManualClock::default());
        let mut monitor = simulated(4.0, &clock);
        let guard = monitor.scoped();
        clock.advance(chrono::Duration::seconds(1));
        assert!((guard.finish().unwrap() - 4.0).abs() < 1e-9);
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }
}
