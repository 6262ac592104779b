use crate::collectors::EnergyUnit;
use crate::tracker::{ActiveReading, FinalizedEntry, LifecycleTracker};
use crate::utils::errors::MonitoringError;
use chrono::{DateTime, Utc};
use itertools::multiunzip;
use polars::prelude::*;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Render an energy value the way every report line does.
pub fn format_energy(energy: Option<f64>, unit: EnergyUnit) -> String {
    match energy {
        Some(value) => format!("{:.10} {}", value, unit),
        None => "unavailable".to_string(),
    }
}

/// Per-cycle view of the active set.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSummary {
    pub cycle: u64,
    pub unit: EnergyUnit,
    pub readings: Vec<ActiveReading>,
    pub total: f64,
}

impl ActiveSummary {
    pub fn collect(tracker: &LifecycleTracker) -> Self {
        let readings = tracker.active_readings();
        let total = readings.iter().filter_map(|reading| reading.energy).sum();
        Self {
            cycle: tracker.cycles(),
            unit: tracker.unit(),
            readings,
            total,
        }
    }
}

impl fmt::Display for ActiveSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Monitoring status (cycle {}) ---", self.cycle)?;
        writeln!(f, "Active processes:")?;
        if self.readings.is_empty() {
            writeln!(f, "  No active processes being monitored.")?;
        }
        for reading in &self.readings {
            writeln!(f, "  {}: {}", reading.handle, format_energy(reading.energy, self.unit))?;
        }
        write!(f, "Active total: {}", format_energy(Some(self.total), self.unit))
    }
}

/// Writes the finalized history block shared by cycle and final output.
pub struct History<'a> {
    pub entries: &'a [FinalizedEntry],
    pub unit: EnergyUnit,
}

impl fmt::Display for History<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Finished processes:")?;
        if self.entries.is_empty() {
            write!(f, "\n  None yet.")?;
        }
        for entry in self.entries {
            write!(f, "\n  {}: {}", entry.handle, format_energy(entry.energy, self.unit))?;
            if let Some(cpu_energy) = entry.cpu_energy {
                write!(f, " (CPU time estimate: {})", format_energy(Some(cpu_energy), self.unit))?;
            }
        }
        Ok(())
    }
}

/// Settled result of a monitoring session.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalReport {
    pub unit: EnergyUnit,
    pub entries: Vec<FinalizedEntry>,
    /// Sum of all available values
    pub total: f64,
    /// Entries whose value was unavailable, left out of `total`
    pub unavailable: usize,
    /// Sum of the CPU-time estimates of entries that have one
    pub cpu_total: f64,
    pub generated_at: DateTime<Utc>,
}

impl FinalReport {
    pub fn settle(tracker: &LifecycleTracker, generated_at: DateTime<Utc>) -> Self {
        let entries = tracker.finalized().to_vec();
        let total = entries.iter().filter_map(|entry| entry.energy).sum();
        let unavailable = entries.iter().filter(|entry| entry.energy.is_none()).count();
        let cpu_total = entries.iter().filter_map(|entry| entry.cpu_energy).sum();
        Self {
            unit: tracker.unit(),
            entries,
            total,
            unavailable,
            cpu_total,
            generated_at,
        }
    }

    /// DataFrame: pid | generation | name | user | energy | unit | cpu_time_s | cpu_energy
    /// | reason | first_seen | finalized_at
    pub fn to_dataframe(&self) -> Result<DataFrame, MonitoringError> {
        let (pids, generations, names, users, energies, cpu_times, cpu_energies, reasons, first_seen, finalized_at): (
            Vec<u32>,
            Vec<u64>,
            Vec<String>,
            Vec<String>,
            Vec<Option<f64>>,
            Vec<Option<f64>>,
            Vec<Option<f64>>,
            Vec<String>,
            Vec<i64>,
            Vec<i64>,
        ) = multiunzip(self.entries.iter().map(|entry| {
            (
                entry.key.pid,
                entry.key.generation,
                entry.handle.name.clone(),
                entry.handle.user.clone(),
                entry.energy,
                entry.cpu_time.map(|used| used.as_secs_f64()),
                entry.cpu_energy,
                entry.reason.to_string(),
                entry.first_seen.timestamp_millis(),
                entry.finalized_at.timestamp_millis(),
            )
        }));
        let units = vec![self.unit.symbol().to_string(); pids.len()];

        df![
            "pid" => pids,
            "generation" => generations,
            "name" => names,
            "user" => users,
            "energy" => energies,
            "unit" => units,
            "cpu_time_s" => cpu_times,
            "cpu_energy" => cpu_energies,
            "reason" => reasons,
            "first_seen" => first_seen,
            "finalized_at" => finalized_at,
        ]
        .map_err(|e| MonitoringError::Report(format!("Failed to create report DataFrame: {}", e)))
    }

    /// Write the report as CSV into `dir`, creating it when missing.
    pub fn write_csv(&self, dir: &Path) -> Result<PathBuf, MonitoringError> {
        fs::create_dir_all(dir)
            .map_err(|e| MonitoringError::Report(format!("{}: {}", dir.display(), e)))?;
        let path = dir.join(format!(
            "energy_report_{}.csv",
            self.generated_at.format("%Y%m%d_%H%M%S")
        ));

        let mut df = self.to_dataframe()?;
        let mut file = File::create(&path)
            .map_err(|e| MonitoringError::Report(format!("{}: {}", path.display(), e)))?;
        CsvWriter::new(&mut file)
            .include_header(true)
            .finish(&mut df)
            .map_err(|e| MonitoringError::Report(format!("Failed to write {}: {}", path.display(), e)))?;
        Ok(path)
    }
}

impl fmt::Display for FinalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Final summary ---")?;
        writeln!(
            f,
            "{}",
            History {
                entries: &self.entries,
                unit: self.unit,
            }
        )?;
        write!(f, "Total consumption: {}", format_energy(Some(self.total), self.unit))?;
        if self.unavailable > 0 {
            write!(f, " ({} processes without a measurement)", self.unavailable)?;
        }
        if self.entries.iter().any(|entry| entry.cpu_energy.is_some()) {
            write!(f, "\nCPU time estimate: {}", format_energy(Some(self.cpu_total), self.unit))?;
        }
        Ok(())
    }
}

/// Presentation hook for the controller.
pub trait ReportSink: Send {
    fn cycle(&mut self, summary: &ActiveSummary, history: &[FinalizedEntry]);

    fn finished(&mut self, report: &FinalReport);
}

/// Prints status blocks to stdout.
#[derive(Debug)]
pub struct ConsoleSink {
    /// Print the finalized history after every cycle once it is non-empty
    pub show_history: bool,
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self { show_history: true }
    }
}

impl ConsoleSink {
    pub fn render_cycle(&self, summary: &ActiveSummary, history: &[FinalizedEntry]) -> String {
        let mut block = summary.to_string();
        if self.show_history && !history.is_empty() {
            block.push('\n');
            block.push_str(
                &History {
                    entries: history,
                    unit: summary.unit,
                }
                .to_string(),
            );
        }
        block
    }
}

impl ReportSink for ConsoleSink {
    fn cycle(&mut self, summary: &ActiveSummary, history: &[FinalizedEntry]) {
        println!("\n{}", self.render_cycle(summary, history));
    }

    fn finished(&mut self, report: &FinalReport) {
        println!("\n{}", report);
    }
}
