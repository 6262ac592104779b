use crate::collectors::{CounterSample, EnergyCounter};
use crate::utils::errors::MonitoringError;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_RAPL_ROOT: &str = "/sys/class/powercap";

#[derive(Debug, Clone)]
struct RaplDomain {
    name: String,
    energy_path: PathBuf,
    max_energy_range_uj: u64,
}

/// Package-level RAPL counters read from the powercap sysfs tree.
///
/// Only top-level `intel-rapl:N` zones are summed; their sub-zones (core,
/// uncore, dram) are already included in the package figure.
#[derive(Debug)]
pub struct Rapl {
    pub rapl_path: PathBuf,
    domains: Vec<RaplDomain>,
}

fn read_u64(path: &Path) -> Result<u64, MonitoringError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| MonitoringError::CounterRead(format!("{}: {}", path.display(), e)))?;
    raw.trim()
        .parse::<u64>()
        .map_err(|e| MonitoringError::CounterRead(format!("{}: {}", path.display(), e)))
}

fn is_package_zone(file_name: &str) -> bool {
    file_name
        .strip_prefix("intel-rapl:")
        .is_some_and(|rest| !rest.is_empty() && !rest.contains(':'))
}

impl Rapl {
    /// Discover readable package zones under `root`.
    ///
    /// Fails with `CollectorUnavailable` when the tree is missing or no zone
    /// counter can be read (recent kernels restrict `energy_uj` to root).
    pub fn discover(root: impl AsRef<Path>) -> Result<Self, MonitoringError> {
        let root = root.as_ref();
        let entries = fs::read_dir(root).map_err(|e| {
            MonitoringError::CollectorUnavailable(format!("{}: {}", root.display(), e))
        })?;

        let mut zones: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| is_package_zone(&entry.file_name().to_string_lossy()))
            .map(|entry| entry.path())
            .collect();
        zones.sort();

        let mut domains = Vec::new();
        for zone in zones {
            let energy_path = zone.join("energy_uj");
            if let Err(e) = read_u64(&energy_path) {
                debug!("Skipping RAPL zone {}: {}", zone.display(), e);
                continue;
            }
            let name = fs::read_to_string(zone.join("name"))
                .map(|n| n.trim().to_string())
                .unwrap_or_else(|_| zone.display().to_string());
            let max_energy_range_uj = read_u64(&zone.join("max_energy_range_uj")).unwrap_or(u64::MAX);
            domains.push(RaplDomain {
                name,
                energy_path,
                max_energy_range_uj,
            });
        }

        if domains.is_empty() {
            return Err(MonitoringError::CollectorUnavailable(format!(
                "no readable RAPL zones under {}",
                root.display()
            )));
        }

        info!(
            "RAPL counters found: {}",
            domains.iter().map(|d| d.name.as_str()).collect::<Vec<_>>().join(", ")
        );
        Ok(Self {
            rapl_path: root.to_path_buf(),
            domains,
        })
    }

    pub fn domain_names(&self) -> Vec<&str> {
        self.domains.iter().map(|d| d.name.as_str()).collect()
    }
}

impl EnergyCounter for Rapl {
    fn name(&self) -> &str {
        "rapl"
    }

    fn sample(&self) -> Result<CounterSample, MonitoringError> {
        self.domains
            .iter()
            .map(|domain| read_u64(&domain.energy_path))
            .collect::<Result<Vec<_>, _>>()
            .map(CounterSample)
    }

    fn joules_between(&self, begin: &CounterSample, end: &CounterSample) -> f64 {
        let micro_joules: u64 = self
            .domains
            .iter()
            .zip(begin.0.iter().zip(end.0.iter()))
            .map(|(domain, (&b, &e))| {
                if e >= b {
                    e - b
                } else {
                    // counter wrapped past max_energy_range_uj
                    domain.max_energy_range_uj.saturating_sub(b).saturating_add(e)
                }
            })
            .sum();
        micro_joules as f64 / 1_000_000.0
    }

    fn is_available() -> bool {
        Path::new(DEFAULT_RAPL_ROOT).join("intel-rapl:0").join("energy_uj").exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_zone(root: &Path, zone: &str, name: &str, energy: u64, max: u64) {
        let dir = root.join(zone);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("name"), format!("{}\n", name)).unwrap();
        fs::write(dir.join("energy_uj"), format!("{}\n", energy)).unwrap();
        fs::write(dir.join("max_energy_range_uj"), format!("{}\n", max)).unwrap();
    }

    #[test]
    fn test_package_zone_filter() {
        assert!(is_package_zone("intel-rapl:0"));
        assert!(is_package_zone("intel-rapl:1"));
        assert!(!is_package_zone("intel-rapl:0:0"));
        assert!(!is_package_zone("intel-rapl"));
        assert!(!is_package_zone("intel-rapl:"));
    }

    #[test]
    fn test_discover_missing_tree_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let result = Rapl::discover(tmp.path().join("nope"));
        assert!(matches!(result, Err(MonitoringError::CollectorUnavailable(_))));
    }

    #[test]
    fn test_discover_empty_tree_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let result = Rapl::discover(tmp.path());
        assert!(matches!(result, Err(MonitoringError::CollectorUnavailable(_))));
    }

    #[test]
    fn test_discover_and_sample_packages_only() {
        let tmp = TempDir::new().unwrap();
        write_zone(tmp.path(), "intel-rapl:0", "package-0", 1_000_000, 10_000_000);
        write_zone(tmp.path(), "intel-rapl:1", "package-1", 2_000_000, 10_000_000);
        write_zone(tmp.path(), "intel-rapl:0:0", "core", 500_000, 10_000_000);

        let rapl = Rapl::discover(tmp.path()).unwrap();
        assert_eq!(rapl.domain_names(), vec!["package-0", "package-1"]);

        let begin = rapl.sample().unwrap();
        assert_eq!(begin, CounterSample(vec![1_000_000, 2_000_000]));

        fs::write(tmp.path().join("intel-rapl:0/energy_uj"), "3000000").unwrap();
        fs::write(tmp.path().join("intel-rapl:1/energy_uj"), "2500000").unwrap();
        let end = rapl.sample().unwrap();
        assert!((rapl.joules_between(&begin, &end) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_wraparound() {
        let tmp = TempDir::new().unwrap();
        write_zone(tmp.path(), "intel-rapl:0", "package-0", 9_000_000, 10_000_000);
        let rapl = Rapl::discover(tmp.path()).unwrap();

        let begin = CounterSample(vec![9_000_000]);
        let end = CounterSample(vec![500_000]);
        assert!((rapl.joules_between(&begin, &end) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_sample_fails_when_counter_disappears() {
        let tmp = TempDir::new().unwrap();
        write_zone(tmp.path(), "intel-rapl:0", "package-0", 1, 10);
        let rapl = Rapl::discover(tmp.path()).unwrap();
        fs::remove_file(tmp.path().join("intel-rapl:0/energy_uj")).unwrap();
        assert!(matches!(rapl.sample(), Err(MonitoringError::CounterRead(_))));
    }
}
