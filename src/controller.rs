use crate::collectors::{EnergyUnit, MeasurementStrategy};
use crate::config::Config;
use crate::monitor::Clock;
use crate::report::{ActiveSummary, FinalReport, ReportSink};
use crate::tracker::{CycleOutcome, LifecycleTracker};
use crate::utils::errors::MonitoringError;
use crate::utils::logger::LogSink;
use crate::utils::psutils::ProcessSource;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cloneable handle used to end a monitoring session from anywhere.
#[derive(Clone, Debug)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Drives snapshot -> reconcile -> report until asked to stop.
pub struct Controller<S: ProcessSource> {
    source: S,
    tracker: LifecycleTracker,
    clock: Arc<dyn Clock>,
    logger: LogSink,
    polling_interval: Duration,
    output_dir: Option<PathBuf>,
    max_cycles: Option<u64>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl<S: ProcessSource> Controller<S> {
    /// Build a fleet controller, resolving the measurement strategy once.
    pub fn new(source: S, config: &Config, clock: Arc<dyn Clock>, logger: LogSink) -> Result<Self, MonitoringError> {
        config.validate()?;
        let strategy = MeasurementStrategy::resolve(config.measurement_method, config.fleet_rate(), &logger)?;
        Ok(Self::with_strategy(
            source,
            strategy,
            EnergyUnit::MegawattHours,
            config,
            clock,
            logger,
        ))
    }

    pub fn with_strategy(
        source: S,
        strategy: MeasurementStrategy,
        unit: EnergyUnit,
        config: &Config,
        clock: Arc<dyn Clock>,
        logger: LogSink,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let tracker = LifecycleTracker::new(strategy, unit, Arc::clone(&clock), logger.child("tracker"));
        Self {
            source,
            tracker,
            clock,
            logger,
            polling_interval: config.polling_interval.0,
            output_dir: config.output_dir.clone(),
            max_cycles: None,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    /// End the session by itself after `cycles` iterations.
    pub fn with_max_cycles(mut self, cycles: u64) -> Self {
        self.max_cycles = Some(cycles);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    pub fn request_stop(&self) {
        self.stop_handle().request_stop();
    }

    pub fn tracker(&self) -> &LifecycleTracker {
        &self.tracker
    }

    /// One reconciliation pass.
    ///
    /// Active pids missing from the snapshot get a direct liveness probe. The
    /// ones still alive, and the ones whose probe failed, are kept as
    /// inaccessible rather than finalized and are checked again next cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, MonitoringError> {
        let mut snapshot = self.source.snapshot().await?;

        for key in self.tracker.active_keys() {
            if snapshot.contains(key.pid) {
                continue;
            }
            match self.source.is_alive(key.pid).await {
                Ok(true) => {
                    snapshot.inaccessible.insert(key.pid);
                }
                Ok(false) => {}
                Err(e) => {
                    self.logger
                        .warn(format!("Liveness probe for PID {} failed, retrying next cycle: {}", key.pid, e));
                    snapshot.inaccessible.insert(key.pid);
                }
            }
        }

        Ok(self.tracker.reconcile(&snapshot))
    }

    /// Poll until stopped, then flush and return the settled report.
    pub async fn run(&mut self, sink: &mut dyn ReportSink) -> Result<FinalReport, MonitoringError> {
        self.logger.info(format!(
            "Process monitoring started (interval {:.2}s)",
            self.polling_interval.as_secs_f64()
        ));
        let mut iterations: u64 = 0;

        loop {
            if *self.stop_rx.borrow_and_update() {
                self.logger.info("Stop requested, finishing monitoring");
                break;
            }

            iterations += 1;
            if let Err(e) = self.run_cycle().await {
                self.logger.warn(format!("Skipping cycle {}: {}", iterations, e));
            }
            sink.cycle(&ActiveSummary::collect(&self.tracker), self.tracker.finalized());

            if self.max_cycles.is_some_and(|max| iterations >= max) {
                self.logger.info(format!("Reached {} cycles, finishing monitoring", iterations));
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.polling_interval) => {}
                _ = self.stop_rx.changed() => {}
            }
        }

        Ok(self.finish(sink))
    }

    fn finish(&mut self, sink: &mut dyn ReportSink) -> FinalReport {
        self.tracker.flush();
        let report = FinalReport::settle(&self.tracker, self.clock.now());

        if let Some(dir) = &self.output_dir {
            match report.write_csv(dir) {
                Ok(path) => self.logger.info(format!("Report written to {}", path.display())),
                Err(e) => self.logger.error(format!("Could not persist report: {}", e)),
            }
        }

        sink.finished(&report);
        report
    }
}
