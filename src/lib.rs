pub mod utils {
    pub mod errors;
    pub mod logger;
    pub mod psutils;
}

// Measurement strategies
pub mod collectors;
pub mod config;
pub mod controller;
pub mod monitor;
pub mod report;
pub mod runner;
pub mod tracker;

pub use collectors::{EnergyUnit, MeasurementMethod, MeasurementStrategy};
pub use config::Config;
pub use controller::{Controller, StopHandle};
pub use monitor::{AccrualMonitor, Clock, ManualClock, MonitorState, SystemClock};
pub use report::{ActiveSummary, ConsoleSink, FinalReport, ReportSink};
pub use runner::{CommandRunner, RunOptions, RunOutcome};
pub use tracker::{EntityKey, FinalizeReason, FinalizedEntry, LifecycleTracker};
pub use utils::errors::MonitoringError;
pub use utils::logger::LogSink;
pub use utils::psutils::{ProcessHandle, ProcessSnapshot, ProcessSource, SysinfoSource};
