//! Per-user accounting: login sessions from `who`, merged with CPU/memory
//! from the process table, GPU memory from `nvidia-smi` compute apps and home
//! directory sizes from `du`. Users are keyed by login name.

use super::system::{
    is_not_available, is_pci_bus_id, parse_f64_loose, parse_leading_u64, ParseError,
};
use crate::state::{GpuRecord, Metric, UserResourceRecord, UserSession};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRow {
    pub pid: u32,
    pub user: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuProcessRow {
    pub pid: u32,
    pub used_memory_mib: u64,
    pub gpu_bus_id: Option<String>,
}

/// Sessions from `who`, grouped by user and ordered by user name.
pub fn parse_sessions(text: &str) -> Result<BTreeMap<String, Vec<UserSession>>, ParseError> {
    let mut sessions: BTreeMap<String, Vec<UserSession>> = BTreeMap::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (head, from) = match line.split_once('(') {
            Some((head, rest)) => (head, rest.trim_end().trim_end_matches(')').trim()),
            None => (line, ""),
        };

        let mut tokens = head.split_whitespace();
        let (Some(user), Some(terminal)) = (tokens.next(), tokens.next()) else {
            return Err(ParseError::new(
                Metric::Users,
                format!("malformed who line '{line}'"),
            ));
        };
        let login_time = tokens.collect::<Vec<_>>().join(" ");

        sessions.entry(user.to_string()).or_default().push(UserSession {
            terminal: terminal.to_string(),
            login_time: (!login_time.is_empty()).then_some(login_time),
            from: from.to_string(),
        });
    }

    Ok(sessions)
}

/// Rows of `ps -eo pid=,user:64=,pcpu=,pmem=`.
pub fn parse_processes(text: &str) -> Result<Vec<ProcessRow>, ParseError> {
    let mut rows = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(ParseError::new(
                Metric::Users,
                format!("unexpected ps row '{line}'"),
            ));
        }
        let bad = || ParseError::new(Metric::Users, format!("bad number in ps row '{line}'"));
        rows.push(ProcessRow {
            pid: fields[0].parse().map_err(|_| bad())?,
            user: fields[1].to_string(),
            cpu_percent: parse_f64_loose(fields[2]).ok_or_else(bad)?,
            memory_percent: parse_f64_loose(fields[3]).ok_or_else(bad)?,
        });
    }

    // ps always lists at least itself.
    if rows.is_empty() {
        return Err(ParseError::new(Metric::Users, "empty process table"));
    }
    Ok(rows)
}

/// Rows of `nvidia-smi --query-compute-apps=pid,used_memory[,gpu_bus_id]`.
/// Processes whose memory the driver hides are skipped.
pub fn parse_gpu_processes(text: &str) -> Result<Vec<GpuProcessRow>, ParseError> {
    let mut rows = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.to_ascii_lowercase().starts_with("no running") {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 2 {
            return Err(ParseError::new(
                Metric::Gpu,
                format!("unexpected compute-apps row '{line}'"),
            ));
        }
        let pid = fields[0].parse::<u32>().map_err(|_| {
            ParseError::new(Metric::Gpu, format!("bad pid in compute-apps row '{line}'"))
        })?;
        if is_not_available(fields[1]) {
            continue;
        }
        let used_memory_mib = parse_leading_u64(fields[1]).ok_or_else(|| {
            ParseError::new(Metric::Gpu, format!("bad used_memory in '{line}'"))
        })?;
        let gpu_bus_id = fields
            .get(2)
            .filter(|v| is_pci_bus_id(v))
            .map(|v| v.to_ascii_uppercase());
        rows.push(GpuProcessRow {
            pid,
            used_memory_mib,
            gpu_bus_id,
        });
    }
    Ok(rows)
}

/// `du -sk /home/*` rows keyed by the home directory's name, in bytes.
pub fn parse_home_usage(text: &str) -> Result<HashMap<String, u64>, ParseError> {
    let mut usage = HashMap::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (size, path) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| ParseError::new(Metric::Users, format!("unexpected du row '{line}'")))?;
        let kib = size
            .parse::<u64>()
            .map_err(|_| ParseError::new(Metric::Users, format!("bad size in du row '{line}'")))?;
        let name = path
            .trim()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ParseError::new(Metric::Users, format!("no path in du row '{line}'")))?;
        *usage.entry(name.to_string()).or_insert(0) += kib.saturating_mul(1024);
    }
    Ok(usage)
}

/// Builds one record per logged-in user.
///
/// A measurement passed as `None` failed for this cycle and leaves the
/// matching field absent on every record. A user missing from a measurement
/// that did succeed gets zero for it.
pub fn merge_users(
    sessions: BTreeMap<String, Vec<UserSession>>,
    processes: Option<&[ProcessRow]>,
    gpu_processes: Option<&[GpuProcessRow]>,
    home_usage: Option<&HashMap<String, u64>>,
) -> Vec<UserResourceRecord> {
    let mut cpu_mem: HashMap<&str, (f64, f64)> = HashMap::new();
    let mut owners: HashMap<u32, &str> = HashMap::new();
    if let Some(processes) = processes {
        for p in processes {
            let entry = cpu_mem.entry(p.user.as_str()).or_insert((0.0, 0.0));
            entry.0 += p.cpu_percent;
            entry.1 += p.memory_percent;
            owners.insert(p.pid, p.user.as_str());
        }
    }

    // Attributing GPU memory needs both the compute apps and their owners.
    let gpu_by_user: Option<HashMap<&str, u64>> = match (gpu_processes, processes) {
        (Some(apps), Some(_)) => {
            let mut by_user = HashMap::new();
            for app in apps {
                if let Some(user) = owners.get(&app.pid) {
                    *by_user.entry(*user).or_insert(0) += app.used_memory_mib;
                }
            }
            Some(by_user)
        }
        _ => None,
    };

    sessions
        .into_iter()
        .map(|(username, sessions)| {
            let (cpu, mem) = cpu_mem
                .get(username.as_str())
                .copied()
                .unwrap_or((0.0, 0.0));
            UserResourceRecord {
                cpu_usage_percent: processes.map(|_| round1(cpu)),
                memory_usage_percent: processes.map(|_| round1(mem)),
                gpu_memory_mib: gpu_by_user
                    .as_ref()
                    .map(|m| m.get(username.as_str()).copied().unwrap_or(0)),
                storage_bytes: home_usage.map(|m| m.get(&username).copied().unwrap_or(0)),
                username,
                sessions,
            }
        })
        .collect()
}

/// Fills `GpuRecord::user` from the owners of the compute processes running
/// on each device, joined by bus id. A user already reported by the GPU
/// query is kept.
pub fn assign_gpu_users(gpus: &mut [GpuRecord], apps: &[GpuProcessRow], processes: &[ProcessRow]) {
    let owners: HashMap<u32, &str> = processes.iter().map(|p| (p.pid, p.user.as_str())).collect();

    for gpu in gpus.iter_mut().filter(|g| g.user.is_none()) {
        let Some(bus_id) = gpu.pci_bus_id.as_deref() else {
            continue;
        };
        let users: BTreeSet<&str> = apps
            .iter()
            .filter(|app| app.gpu_bus_id.as_deref() == Some(bus_id))
            .filter_map(|app| owners.get(&app.pid).copied())
            .collect();
        if !users.is_empty() {
            gpu.user = Some(users.into_iter().collect::<Vec<_>>().join(","));
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
