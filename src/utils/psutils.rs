use crate::utils::errors::MonitoringError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use users::{Users, UsersCache};

pub const UNKNOWN: &str = "unknown";

/// Descriptive identity of one observed process. Owns no OS resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub name: String,
    pub user: String,
    /// OS start time in seconds since the epoch, when the platform reports it.
    pub started_at: Option<u64>,
    /// Accumulated user + kernel CPU time at the moment of the snapshot.
    pub cpu_time: Option<Duration>,
}

impl ProcessHandle {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            user: UNKNOWN.to_string(),
            started_at: None,
            cpu_time: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_started_at(mut self, started_at: u64) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn with_cpu_time(mut self, cpu_time: Duration) -> Self {
        self.cpu_time = Some(cpu_time);
        self
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (PID {})", self.name, self.pid)
    }
}

/// One enumeration pass over the process table.
///
/// `inaccessible` holds pids known to exist whose metadata could not be read
/// this time. They count as alive but are never discovered from this snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    processes: Vec<ProcessHandle>,
    /// pid -> position in `processes`, first occurrence wins
    index: HashMap<u32, usize>,
    pub inaccessible: HashSet<u32>,
}

impl ProcessSnapshot {
    pub fn new(processes: Vec<ProcessHandle>) -> Self {
        let mut index = HashMap::with_capacity(processes.len());
        for (position, process) in processes.iter().enumerate() {
            index.entry(process.pid).or_insert(position);
        }
        Self {
            processes,
            index,
            inaccessible: HashSet::new(),
        }
    }

    pub fn processes(&self) -> &[ProcessHandle] {
        &self.processes
    }

    pub fn with_inaccessible(mut self, pids: impl IntoIterator<Item = u32>) -> Self {
        self.inaccessible.extend(pids);
        self
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessHandle> {
        self.index.get(&pid).map(|&position| &self.processes[position])
    }

    /// Whether the pid is present at all, readable or not.
    pub fn contains(&self, pid: u32) -> bool {
        self.index.contains_key(&pid) || self.inaccessible.contains(&pid)
    }

    pub fn len(&self) -> usize {
        self.processes.len() + self.inaccessible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source of process snapshots and liveness probes.
#[async_trait]
pub trait ProcessSource: Send + Sync {
    /// Enumerate live processes. Per-process failures belong in
    /// `ProcessSnapshot::inaccessible`; only a failure of the whole pass is an error.
    async fn snapshot(&self) -> Result<ProcessSnapshot, MonitoringError>;

    /// Direct liveness probe for a single pid.
    async fn is_alive(&self, pid: u32) -> Result<bool, MonitoringError>;

    /// Accumulated CPU time of a single pid, `None` when it is gone or the
    /// platform does not report it.
    async fn cpu_time(&self, _pid: u32) -> Result<Option<Duration>, MonitoringError> {
        Ok(None)
    }
}

/// Utility function to resolve a user ID to a username
pub fn resolve_username(uid: u32, users_cache: &UsersCache) -> String {
    users_cache
        .get_user_by_uid(uid)
        .map(|user| user.name().to_string_lossy().to_string())
        .unwrap_or_else(|| uid.to_string())
}

/// Strip any path component from a process name.
pub fn resolve_display_name(name: &str) -> String {
    let name = name.rsplit('/').next().unwrap_or("").trim();
    if name.is_empty() {
        UNKNOWN.to_string()
    } else {
        name.to_string()
    }
}

fn is_terminated(status: ProcessStatus) -> bool {
    matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

struct SysinfoState {
    system: System,
    users_cache: UsersCache,
}

/// `ProcessSource` backed by `sysinfo`.
///
/// Refreshes run on the blocking pool, the process table can take a while to
/// walk on busy hosts.
#[derive(Clone)]
pub struct SysinfoSource {
    state: Arc<Mutex<SysinfoState>>,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SysinfoState {
                system: System::new(),
                users_cache: UsersCache::new(),
            })),
        }
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::nothing()
            .with_user(UpdateKind::OnlyIfNotSet)
            .with_cpu()
    }

    fn collect(state: &mut SysinfoState) -> Result<ProcessSnapshot, MonitoringError> {
        state
            .system
            .refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());

        let processes = state.system.processes();
        if processes.is_empty() {
            return Err(MonitoringError::ProcessDiscoveryError(
                "No processes found on system".to_string(),
            ));
        }

        let mut handles = Vec::with_capacity(processes.len());
        for (pid, process) in processes {
            if is_terminated(process.status()) {
                continue;
            }
            let user = process
                .user_id()
                .map(|uid| resolve_username(**uid, &state.users_cache))
                .unwrap_or_else(|| UNKNOWN.to_string());
            let name = resolve_display_name(&process.name().to_string_lossy());
            handles.push(
                ProcessHandle::new(pid.as_u32(), name)
                    .with_user(user)
                    .with_started_at(process.start_time())
                    .with_cpu_time(Duration::from_millis(process.accumulated_cpu_time())),
            );
        }

        Ok(ProcessSnapshot::new(handles))
    }

    fn probe(state: &mut SysinfoState, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        state
            .system
            .refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, ProcessRefreshKind::nothing());
        state
            .system
            .process(pid)
            .map(|process| !is_terminated(process.status()))
            .unwrap_or(false)
    }

    fn probe_cpu_time(state: &mut SysinfoState, pid: u32) -> Option<Duration> {
        let pid = Pid::from_u32(pid);
        state.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu(),
        );
        state
            .system
            .process(pid)
            .filter(|process| !is_terminated(process.status()))
            .map(|process| Duration::from_millis(process.accumulated_cpu_time()))
    }

    async fn with_state<R, F>(&self, f: F) -> Result<R, MonitoringError>
    where
        R: Send + 'static,
        F: FnOnce(&mut SysinfoState) -> Result<R, MonitoringError> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || {
            let mut guard = state
                .lock()
                .map_err(|_| MonitoringError::SysinfoError("process table lock poisoned".to_string()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| MonitoringError::SysinfoError(format!("refresh task failed: {}", e)))?
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSource for SysinfoSource {
    async fn snapshot(&self) -> Result<ProcessSnapshot, MonitoringError> {
        self.with_state(Self::collect).await
    }

    async fn is_alive(&self, pid: u32) -> Result<bool, MonitoringError> {
        self.with_state(move |state| Ok(Self::probe(state, pid))).await
    }

    async fn cpu_time(&self, pid: u32) -> Result<Option<Duration>, MonitoringError> {
        self.with_state(move |state| Ok(Self::probe_cpu_time(state, pid))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_display_name() {
        assert_eq!(resolve_display_name("/usr/bin/python3"), "python3");
        assert_eq!(resolve_display_name("bash"), "bash");
        assert_eq!(resolve_display_name(""), UNKNOWN);
        assert_eq!(resolve_display_name("  "), UNKNOWN);
    }

    #[test]
    fn test_snapshot_contains_inaccessible() {
        let snapshot = ProcessSnapshot::new(vec![ProcessHandle::new(10, "a")]).with_inaccessible([11]);
        assert!(snapshot.contains(10));
        assert!(snapshot.contains(11));
        assert!(!snapshot.contains(12));
        assert!(snapshot.get(11).is_none());
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_snapshot_lookup_by_pid() {
        let snapshot = ProcessSnapshot::new(vec![
            ProcessHandle::new(30, "c"),
            ProcessHandle::new(10, "a"),
            ProcessHandle::new(20, "b"),
            ProcessHandle::new(10, "a-dup"),
        ]);
        assert_eq!(snapshot.get(20).unwrap().name, "b");
        assert_eq!(snapshot.get(10).unwrap().name, "a");
        assert!(snapshot.get(40).is_none());
        assert!(!snapshot.contains(40));
        assert_eq!(snapshot.processes().len(), 4);
    }

    #[test]
    fn test_resolve_unknown_uid_falls_back_to_number() {
        let users_cache = UsersCache::new();
        assert_eq!(resolve_username(4_000_000_000, &users_cache), "4000000000");
    }

    #[tokio::test]
    async fn test_sysinfo_snapshot_sees_current_process() {
        let source = SysinfoSource::new();
        let snapshot = source.snapshot().await.unwrap();
        let me = std::process::id();
        assert!(snapshot.contains(me));
        assert!(source.is_alive(me).await.unwrap());
        assert!(source.cpu_time(me).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sysinfo_nonexistent_pid_is_not_alive() {
        let source = SysinfoSource::new();
        assert!(!source.is_alive(u32::MAX - 1).await.unwrap());
    }
}
