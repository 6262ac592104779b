use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitoringError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Sysinfo error: {0}")]
    SysinfoError(String),
    #[error("Process discovery error: {0}")]
    ProcessDiscoveryError(String),
    #[error("Collector unavailable: {0}")]
    CollectorUnavailable(String),
    #[error("Energy counter read failed: {0}")]
    CounterRead(String),
    #[error("Command execution failed: {0}")]
    CommandFailed(#[from] std::io::Error),
    #[error("Report error: {0}")]
    Report(String),
}
