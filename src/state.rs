use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Gpu,
    Cpu,
    Memory,
    Disk,
    Storage,
    Users,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Gpu,
        Metric::Cpu,
        Metric::Memory,
        Metric::Disk,
        Metric::Storage,
        Metric::Users,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Gpu => "gpu",
            Metric::Cpu => "cpu",
            Metric::Memory => "memory",
            Metric::Disk => "disk",
            Metric::Storage => "storage",
            Metric::Users => "users",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connection,
    Timeout,
    NonZeroExit,
    Parse,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Connection => "connection",
            FailureKind::Timeout => "timeout",
            FailureKind::NonZeroExit => "non_zero_exit",
            FailureKind::Parse => "parse",
        }
    }
}

/// Why one metric is missing from a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricFailure {
    pub metric: Metric,
    pub command: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuRecord {
    pub id: String,
    pub name: String,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
    pub memory_usage_percent: f64,
    pub temperature_celsius: Option<f64>,
    pub power_draw_watts: Option<f64>,
    pub pci_bus_id: Option<String>,
    /// Owner(s) of the compute processes on this device, comma separated.
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuStat {
    pub usage_percent: f64,
    pub core_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStat {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub available_bytes: Option<u64>,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskStat {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageDisk {
    pub filesystem: String,
    pub mount_point: String,
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SystemResources {
    pub cpu: Option<CpuStat>,
    pub memory: Option<MemoryStat>,
    pub disk: Option<DiskStat>,
    pub storage_disks: Option<Vec<StorageDisk>>,
    pub storage_summary: Option<DiskStat>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSession {
    pub terminal: String,
    pub login_time: Option<String>,
    /// Remote origin from `who`, empty for local logins.
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserResourceRecord {
    pub username: String,
    pub cpu_usage_percent: Option<f64>,
    pub memory_usage_percent: Option<f64>,
    pub gpu_memory_mib: Option<u64>,
    pub storage_bytes: Option<u64>,
    pub sessions: Vec<UserSession>,
}

/// One capture of every tracked metric. Never mutated after it is built.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Snapshot {
    pub captured_at_unix: i64,
    pub gpus: Vec<GpuRecord>,
    pub users: Vec<UserResourceRecord>,
    pub system: SystemResources,
    pub failures: Vec<MetricFailure>,
}

impl Snapshot {
    /// Snapshot for a cycle in which the remote host could not be reached at all.
    pub fn unreachable(captured_at_unix: i64, command: &str, message: &str) -> Self {
        let failures = Metric::ALL
            .iter()
            .map(|metric| MetricFailure {
                metric: *metric,
                command: command.to_string(),
                kind: FailureKind::Connection,
                message: message.to_string(),
            })
            .collect();
        Self {
            captured_at_unix,
            failures,
            ..Self::default()
        }
    }

    pub fn failure(&self, metric: Metric) -> Option<&MetricFailure> {
        self.failures.iter().find(|f| f.metric == metric)
    }

    /// True when every metric failed because the session itself was unusable.
    pub fn is_session_failure(&self) -> bool {
        Metric::ALL.iter().all(|metric| {
            self.failure(*metric)
                .is_some_and(|f| f.kind == FailureKind::Connection)
        })
    }

    pub fn connection_error(&self) -> Option<&str> {
        self.failures
            .iter()
            .find(|f| f.kind == FailureKind::Connection)
            .map(|f| f.message.as_str())
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `used / total * 100`, 0 when total is 0.
pub fn usage_percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_percent_halves_and_guards_zero_total() {
        assert_eq!(usage_percent(8192, 16384), 50.0);
        assert_eq!(usage_percent(1024, 16384), 6.25);
        assert_eq!(usage_percent(8192, 0), 0.0);
        assert_eq!(usage_percent(0, 0), 0.0);
    }

    #[test]
    fn unreachable_snapshot_fails_every_metric() {
        let snapshot = Snapshot::unreachable(7, "connect", "auth rejected");
        assert_eq!(snapshot.failures.len(), Metric::ALL.len());
        assert!(snapshot.is_session_failure());
        assert_eq!(snapshot.connection_error(), Some("auth rejected"));
        assert!(snapshot.gpus.is_empty());
        assert_eq!(snapshot.system, SystemResources::default());
    }

    #[test]
    fn single_connection_failure_is_not_session_failure() {
        let snapshot = Snapshot {
            failures: vec![MetricFailure {
                metric: Metric::Gpu,
                command: "gpu_query".to_string(),
                kind: FailureKind::Connection,
                message: "channel closed".to_string(),
            }],
            ..Snapshot::default()
        };
        assert!(!snapshot.is_session_failure());
    }
}
