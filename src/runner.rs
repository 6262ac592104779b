use crate::collectors::{EnergyUnit, MeasurementStrategy, cpu_time_energy};
use crate::monitor::{AccrualMonitor, Clock};
use crate::report::format_energy;
use crate::utils::errors::MonitoringError;
use crate::utils::logger::LogSink;
use crate::utils::psutils::ProcessSource;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long pipes may keep draining once the command is gone. A background
/// grandchild can hold them open indefinitely.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Run the command through the platform shell
    pub shell: bool,
    pub label: String,
    pub timeout: Option<Duration>,
    /// Capture stdout/stderr instead of inheriting the terminal
    pub capture_output: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            shell: false,
            label: "ProcessRunner".to_string(),
            timeout: None,
            capture_output: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// `None` when the command timed out or was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub energy_consumed: Option<f64>,
    pub unit: EnergyUnit,
    pub timed_out: bool,
    pub elapsed: Duration,
    /// Last CPU time observed for the command's process
    pub cpu_time: Option<Duration>,
    /// `cpu_time` converted with the fixed CPU power figure
    pub cpu_energy: Option<f64>,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs one external command inside a monitor bracket.
pub struct CommandRunner {
    strategy: MeasurementStrategy,
    unit: EnergyUnit,
    clock: Arc<dyn Clock>,
    logger: LogSink,
    cpu_source: Option<Arc<dyn ProcessSource>>,
    cpu_sample_interval: Duration,
}

/// Collects a child pipe in the background. Whatever arrived before the
/// child was killed is kept.
struct OutputReader {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl OutputReader {
    fn spawn<R>(mut pipe: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let task = tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self { buffer, task }
    }

    async fn collect(mut self) -> String {
        if tokio::time::timeout(OUTPUT_GRACE, &mut self.task).await.is_err() {
            self.task.abort();
        }
        let bytes = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

async fn collect_output(reader: Option<OutputReader>) -> String {
    match reader {
        Some(reader) => reader.collect().await,
        None => String::new(),
    }
}

/// Polls the CPU time of a running child; keeps the highest value seen.
struct CpuSampler {
    latest: watch::Receiver<Option<Duration>>,
    task: JoinHandle<()>,
}

impl CpuSampler {
    fn spawn(source: Arc<dyn ProcessSource>, pid: u32, interval: Duration, logger: LogSink) -> Self {
        let (tx, latest) = watch::channel(None);
        let task = tokio::spawn(async move {
            loop {
                match source.cpu_time(pid).await {
                    Ok(Some(used)) => {
                        tx.send_if_modified(|seen| {
                            if (*seen).is_none_or(|previous| used > previous) {
                                *seen = Some(used);
                                true
                            } else {
                                false
                            }
                        });
                    }
                    Ok(None) => {}
                    Err(e) => logger.debug(format!("CPU time sample for PID {} failed: {}", pid, e)),
                }
                tokio::time::sleep(interval).await;
            }
        });
        Self { latest, task }
    }

    fn finish(self) -> Option<Duration> {
        self.task.abort();
        *self.latest.borrow()
    }
}

fn build_command(command: &[String], shell: bool) -> Command {
    if shell {
        let line = command.join(" ");
        #[cfg(windows)]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C");
            cmd
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c");
            cmd
        };
        cmd.arg(line);
        cmd
    } else {
        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..]);
        cmd
    }
}

impl CommandRunner {
    pub fn new(strategy: MeasurementStrategy, unit: EnergyUnit, clock: Arc<dyn Clock>, logger: LogSink) -> Self {
        Self {
            strategy,
            unit,
            clock,
            logger,
            cpu_source: None,
            cpu_sample_interval: CPU_SAMPLE_INTERVAL,
        }
    }

    /// Sample the child's CPU time from `source` while it runs.
    pub fn with_cpu_source(mut self, source: Arc<dyn ProcessSource>) -> Self {
        self.cpu_source = Some(source);
        self
    }

    pub fn with_cpu_sample_interval(mut self, interval: Duration) -> Self {
        self.cpu_sample_interval = interval;
        self
    }

    /// Execute `command` and measure it.
    ///
    /// A timeout is a normal outcome (`timed_out = true`, child killed). Spawn
    /// or wait failures are returned as errors once the monitor has stopped.
    pub async fn run(&self, command: &[String], options: &RunOptions) -> Result<RunOutcome, MonitoringError> {
        if command.is_empty() {
            return Err(MonitoringError::InvalidConfig("no command given".to_string()));
        }
        self.logger.info(format!(
            "Running command: {} (shell={})",
            command.join(" "),
            options.shell
        ));

        let mut cmd = build_command(command, options.shell);
        cmd.kill_on_drop(true).stdin(Stdio::null());
        if options.capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }

        let mut monitor = AccrualMonitor::new(
            options.label.clone(),
            self.strategy.clone(),
            self.unit,
            Arc::clone(&self.clock),
            self.logger.child("monitor"),
        );
        let started = Instant::now();
        let guard = monitor.scoped();

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                guard.finish();
                self.logger.error(format!("Failed to start '{}': {}", command[0], e));
                return Err(MonitoringError::CommandFailed(e));
            }
        };

        let stdout = child.stdout.take().map(OutputReader::spawn);
        let stderr = child.stderr.take().map(OutputReader::spawn);
        let sampler = match (&self.cpu_source, child.id()) {
            (Some(source), Some(pid)) => Some(CpuSampler::spawn(
                Arc::clone(source),
                pid,
                self.cpu_sample_interval,
                self.logger.child("cpu"),
            )),
            _ => None,
        };

        let waited = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };
        if waited.is_none() {
            if let Err(e) = child.kill().await {
                self.logger.warn(format!("Could not kill '{}' after timeout: {}", command[0], e));
            }
        }
        let energy_consumed = guard.finish();
        let elapsed = started.elapsed();
        let cpu_time = sampler.and_then(CpuSampler::finish);
        let cpu_energy = cpu_time.map(|used| cpu_time_energy(used, self.unit));
        let stdout = collect_output(stdout).await;
        let stderr = collect_output(stderr).await;

        let (exit_code, timed_out) = match waited {
            None => {
                self.logger.error(format!(
                    "Command exceeded the time limit of {:.1} seconds",
                    options.timeout.unwrap_or_default().as_secs_f64()
                ));
                (None, true)
            }
            Some(Err(e)) => {
                self.logger.error(format!("Error while running '{}': {}", command[0], e));
                return Err(MonitoringError::CommandFailed(e));
            }
            Some(Ok(status)) => {
                self.logger.info(format!("Command finished with exit code {:?}", status.code()));
                (status.code(), false)
            }
        };

        let outcome = RunOutcome {
            exit_code,
            stdout,
            stderr,
            energy_consumed,
            unit: self.unit,
            timed_out,
            elapsed,
            cpu_time,
            cpu_energy,
        };

        self.logger.info(format!(
            "Energy consumed by '{}': {}",
            options.label,
            format_energy(outcome.energy_consumed, self.unit)
        ));
        Ok(outcome)
    }
}
