use crate::collectors::{EnergyUnit, MeasurementStrategy, cpu_time_energy};
use crate::monitor::{AccrualMonitor, Clock};
use crate::report::format_energy;
use crate::utils::logger::LogSink;
use crate::utils::psutils::{ProcessHandle, ProcessSnapshot};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Identity of one tracked process lifetime.
///
/// Pids are recycled by the OS, so each discovery gets a fresh generation and
/// a reused pid is a different entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub pid: u32,
    pub generation: u64,
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.pid, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    /// Gone from the process table.
    Exited,
    /// Pid now belongs to a process with a different start time.
    PidReused,
    /// Still running when monitoring stopped.
    Flushed,
}

impl fmt::Display for FinalizeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalizeReason::Exited => f.write_str("exited"),
            FinalizeReason::PidReused => f.write_str("pid_reused"),
            FinalizeReason::Flushed => f.write_str("flushed"),
        }
    }
}

#[derive(Debug)]
pub struct MonitoredEntry {
    pub key: EntityKey,
    pub handle: ProcessHandle,
    pub monitor: AccrualMonitor,
    pub first_seen: DateTime<Utc>,
    /// CPU time the process had already accumulated when discovered
    pub cpu_baseline: Option<Duration>,
}

impl MonitoredEntry {
    /// CPU time used while monitored, from the latest observation.
    pub fn cpu_time_used(&self) -> Option<Duration> {
        let latest = self.handle.cpu_time?;
        Some(latest.saturating_sub(self.cpu_baseline.unwrap_or(Duration::ZERO)))
    }
}

/// Settled record of a process lifetime. Never modified once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedEntry {
    pub key: EntityKey,
    pub handle: ProcessHandle,
    /// `None` when the measurement could not be completed.
    pub energy: Option<f64>,
    /// CPU time used while monitored, last observed before finalizing.
    pub cpu_time: Option<Duration>,
    /// `cpu_time` converted with the fixed CPU power figure.
    pub cpu_energy: Option<f64>,
    pub first_seen: DateTime<Utc>,
    pub finalized_at: DateTime<Utc>,
    pub reason: FinalizeReason,
}

/// What a single reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub started: Vec<EntityKey>,
    pub finalized: Vec<EntityKey>,
}

impl CycleOutcome {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.finalized.is_empty()
    }
}

/// Live projection for one active entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveReading {
    pub key: EntityKey,
    pub handle: ProcessHandle,
    pub energy: Option<f64>,
}

/// Owns the active monitors and the finalized history.
pub struct LifecycleTracker {
    strategy: MeasurementStrategy,
    unit: EnergyUnit,
    clock: Arc<dyn Clock>,
    logger: LogSink,
    /// pid -> the live generation for that pid
    active: HashMap<u32, MonitoredEntry>,
    /// Append-only; a recycled pid adds a second entry
    finalized: Vec<FinalizedEntry>,
    next_generation: u64,
    cycles: u64,
}

impl LifecycleTracker {
    pub fn new(strategy: MeasurementStrategy, unit: EnergyUnit, clock: Arc<dyn Clock>, logger: LogSink) -> Self {
        Self {
            strategy,
            unit,
            clock,
            logger,
            active: HashMap::new(),
            finalized: Vec::new(),
            next_generation: 0,
            cycles: 0,
        }
    }

    pub fn unit(&self) -> EnergyUnit {
        self.unit
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, pid: u32) -> bool {
        self.active.contains_key(&pid)
    }

    pub fn active_entry(&self, pid: u32) -> Option<&MonitoredEntry> {
        self.active.get(&pid)
    }

    pub fn active_keys(&self) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self.active.values().map(|entry| entry.key).collect();
        keys.sort();
        keys
    }

    pub fn finalized(&self) -> &[FinalizedEntry] {
        &self.finalized
    }

    /// Every finalized lifetime of `pid`, oldest first.
    pub fn finalized_for(&self, pid: u32) -> impl Iterator<Item = &FinalizedEntry> {
        self.finalized.iter().filter(move |entry| entry.key.pid == pid)
    }

    /// No entity is both active and finalized.
    pub fn is_consistent(&self) -> bool {
        let finalized: HashSet<EntityKey> = self.finalized.iter().map(|entry| entry.key).collect();
        finalized.len() == self.finalized.len()
            && self.active.values().all(|entry| !finalized.contains(&entry.key))
    }

    /// Bring tracked state in line with `snapshot`.
    ///
    /// Deaths are settled first, then new pids are started. A pid settled in
    /// this cycle is not rediscovered until the next one, so each pid gets at
    /// most one outcome per cycle.
    pub fn reconcile(&mut self, snapshot: &ProcessSnapshot) -> CycleOutcome {
        self.cycles += 1;
        let mut outcome = CycleOutcome::default();

        // death detection
        let mut departed: Vec<(u32, FinalizeReason)> = self
            .active
            .iter()
            .filter_map(|(&pid, entry)| match snapshot.get(pid) {
                Some(seen) if is_reused(&entry.handle, seen) => Some((pid, FinalizeReason::PidReused)),
                Some(_) => None,
                None if snapshot.inaccessible.contains(&pid) => None,
                None => Some((pid, FinalizeReason::Exited)),
            })
            .collect();
        departed.sort_by_key(|(pid, _)| *pid);

        let mut settled_now: HashSet<u32> = HashSet::new();
        for (pid, reason) in departed {
            if let Some(entry) = self.active.remove(&pid) {
                outcome.finalized.push(self.settle(entry, reason));
                settled_now.insert(pid);
            }
        }

        for handle in snapshot.processes() {
            if let Some(entry) = self.active.get_mut(&handle.pid) {
                if handle.cpu_time.is_some() {
                    entry.handle.cpu_time = handle.cpu_time;
                }
            }
        }

        // discovery
        for handle in snapshot.processes() {
            if self.active.contains_key(&handle.pid) || settled_now.contains(&handle.pid) {
                continue;
            }
            outcome.started.push(self.begin(handle.clone()));
        }

        if !outcome.is_empty() {
            self.logger.debug(format!(
                "Cycle {}: {} started, {} finalized, {} active",
                self.cycles,
                outcome.started.len(),
                outcome.finalized.len(),
                self.active.len()
            ));
        }
        outcome
    }

    /// Live projections for every active entity, ordered by pid.
    pub fn active_readings(&self) -> Vec<ActiveReading> {
        let mut readings: Vec<ActiveReading> = self
            .active
            .values()
            .map(|entry| ActiveReading {
                key: entry.key,
                handle: entry.handle.clone(),
                energy: entry.monitor.projected_energy(),
            })
            .collect();
        readings.sort_by_key(|reading| reading.key);
        readings
    }

    /// Sum of live projections; unavailable projections contribute nothing.
    pub fn active_total(&self) -> f64 {
        self.active
            .values()
            .filter_map(|entry| entry.monitor.projected_energy())
            .sum()
    }

    /// Stop every remaining monitor and move it to the finalized history.
    pub fn flush(&mut self) -> Vec<EntityKey> {
        let mut remaining: Vec<MonitoredEntry> = self.active.drain().map(|(_, entry)| entry).collect();
        remaining.sort_by_key(|entry| entry.key);
        let flushed: Vec<EntityKey> = remaining
            .into_iter()
            .map(|entry| self.settle(entry, FinalizeReason::Flushed))
            .collect();
        if !flushed.is_empty() {
            self.logger.info(format!("Flushed {} active monitors", flushed.len()));
        }
        flushed
    }

    fn begin(&mut self, handle: ProcessHandle) -> EntityKey {
        let key = EntityKey {
            pid: handle.pid,
            generation: self.next_generation,
        };
        self.next_generation += 1;

        let mut monitor = AccrualMonitor::new(
            format!("{}_{}", handle.name, handle.pid),
            self.strategy.clone(),
            self.unit,
            Arc::clone(&self.clock),
            self.logger.child("monitor"),
        );
        monitor.start();
        self.logger.info(format!("Monitoring started: {}", handle));

        self.active.insert(
            handle.pid,
            MonitoredEntry {
                key,
                cpu_baseline: handle.cpu_time,
                handle,
                monitor,
                first_seen: self.clock.now(),
            },
        );
        key
    }

    fn settle(&mut self, mut entry: MonitoredEntry, reason: FinalizeReason) -> EntityKey {
        entry.monitor.stop();
        let energy = entry.monitor.final_energy();
        self.logger.info(format!(
            "Process finished ({}): {}. Energy recorded: {}",
            reason,
            entry.handle,
            format_energy(energy, self.unit)
        ));

        let key = entry.key;
        let cpu_time = entry.cpu_time_used();
        self.finalized.push(FinalizedEntry {
            key,
            energy,
            cpu_time,
            cpu_energy: cpu_time.map(|used| cpu_time_energy(used, self.unit)),
            handle: entry.handle,
            first_seen: entry.first_seen,
            finalized_at: entry.monitor.end_time().unwrap_or_else(|| self.clock.now()),
            reason,
        });
        key
    }
}

fn is_reused(tracked: &ProcessHandle, seen: &ProcessHandle) -> bool {
    matches!((tracked.started_at, seen.started_at), (Some(a), Some(b)) if a != b)
}
