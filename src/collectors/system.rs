//! Parsers for the host-wide metrics: GPUs, CPU, memory and filesystems.
//!
//! Every parser is a pure function over one command's stdout. On input it
//! does not recognize it returns a [`ParseError`] rather than a record full
//! of zeros.

use crate::state::{
    usage_percent, DiskStat, GpuRecord, MemoryStat, Metric, StorageDisk,
};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot parse {metric} output: {reason}")]
pub struct ParseError {
    pub metric: Metric,
    pub reason: String,
}

impl ParseError {
    pub fn new(metric: Metric, reason: impl Into<String>) -> Self {
        Self {
            metric,
            reason: reason.into(),
        }
    }
}

/// Mounts that never count as storage disks.
const IGNORED_MOUNT_PREFIXES: [&str; 6] = ["/snap", "/boot", "/run", "/dev", "/sys", "/proc"];

/// Parses `nvidia-smi --query-gpu=index,name,memory.used,memory.total,temperature.gpu,power.draw`
/// in `csv,noheader,nounits` form. Trailing columns may carry the device's
/// `pci.bus_id` and the user currently holding it, in either order.
pub fn parse_gpus(text: &str) -> Result<Vec<GpuRecord>, ParseError> {
    let mut gpus = Vec::new();
    let mut ids = HashSet::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 6 {
            return Err(ParseError::new(
                Metric::Gpu,
                format!("expected at least 6 columns, got {}: '{line}'", parts.len()),
            ));
        }

        let id = parts[0];
        if id.is_empty() {
            return Err(ParseError::new(Metric::Gpu, format!("empty GPU index: '{line}'")));
        }
        if !ids.insert(id.to_string()) {
            return Err(ParseError::new(Metric::Gpu, format!("duplicate GPU index {id}")));
        }

        let memory_used_mib = parse_leading_u64(parts[2]).ok_or_else(|| {
            ParseError::new(Metric::Gpu, format!("bad memory.used '{}'", parts[2]))
        })?;
        let memory_total_mib = parse_leading_u64(parts[3]).ok_or_else(|| {
            ParseError::new(Metric::Gpu, format!("bad memory.total '{}'", parts[3]))
        })?;
        let temperature_celsius = parse_optional_reading(parts[4], "temperature.gpu")?;
        let power_draw_watts = parse_optional_reading(parts[5], "power.draw")?;
        let mut pci_bus_id = None;
        let mut user = None;
        for extra in parts[6..]
            .iter()
            .filter(|v| !v.is_empty() && !is_not_available(v))
        {
            if is_pci_bus_id(extra) {
                pci_bus_id = Some(extra.to_ascii_uppercase());
            } else {
                user = Some(extra.to_string());
            }
        }

        gpus.push(GpuRecord {
            id: id.to_string(),
            name: parts[1].to_string(),
            memory_used_mib,
            memory_total_mib,
            memory_usage_percent: usage_percent(memory_used_mib, memory_total_mib),
            temperature_celsius,
            power_draw_watts,
            pci_bus_id,
            user,
        });
    }

    if gpus.is_empty() {
        return Err(ParseError::new(Metric::Gpu, "no GPU rows in output"));
    }
    Ok(gpus)
}

/// Parses the `Mem:` row of `free -b`.
pub fn parse_memory(text: &str) -> Result<MemoryStat, ParseError> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("Mem:"))
        .ok_or_else(|| ParseError::new(Metric::Memory, "no 'Mem:' line"))?;

    let fields: Vec<&str> = line.split_whitespace().skip(1).collect();
    if fields.len() < 2 {
        return Err(ParseError::new(
            Metric::Memory,
            format!("too few fields in '{line}'"),
        ));
    }
    let total_bytes = fields[0]
        .parse::<u64>()
        .map_err(|_| ParseError::new(Metric::Memory, format!("bad total '{}'", fields[0])))?;
    let used_bytes = fields[1]
        .parse::<u64>()
        .map_err(|_| ParseError::new(Metric::Memory, format!("bad used '{}'", fields[1])))?;
    // total used free shared buff/cache available
    let available_bytes = fields.get(5).and_then(|v| v.parse::<u64>().ok());

    Ok(MemoryStat {
        used_bytes,
        total_bytes,
        available_bytes,
        usage_percent: usage_percent(used_bytes, total_bytes),
    })
}

/// One data row of `df -P -B1`.
#[derive(Debug, Clone, PartialEq)]
struct DfRow {
    filesystem: String,
    total_bytes: u64,
    used_bytes: u64,
    available_bytes: u64,
    mount_point: String,
}

fn parse_df(text: &str, metric: Metric) -> Result<Vec<DfRow>, ParseError> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let header = lines
        .next()
        .ok_or_else(|| ParseError::new(metric, "empty df output"))?;
    if !header.starts_with("Filesystem") {
        return Err(ParseError::new(
            metric,
            format!("unexpected df header '{header}'"),
        ));
    }

    let mut rows = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            return Err(ParseError::new(metric, format!("short df row '{line}'")));
        }
        let number = |i: usize| {
            fields[i]
                .parse::<u64>()
                .map_err(|_| ParseError::new(metric, format!("bad number '{}' in '{line}'", fields[i])))
        };
        rows.push(DfRow {
            filesystem: fields[0].to_string(),
            total_bytes: number(1)?,
            used_bytes: number(2)?,
            available_bytes: number(3)?,
            // Mount points may contain spaces.
            mount_point: fields[5..].join(" "),
        });
    }
    Ok(rows)
}

/// Parses `df -P -B1 /` into the root filesystem usage.
pub fn parse_root_disk(text: &str) -> Result<DiskStat, ParseError> {
    let rows = parse_df(text, Metric::Disk)?;
    let row = rows
        .iter()
        .find(|r| r.mount_point == "/")
        .or_else(|| rows.last())
        .ok_or_else(|| ParseError::new(Metric::Disk, "no filesystem row"))?;

    Ok(DiskStat {
        used_bytes: row.used_bytes,
        total_bytes: row.total_bytes,
        available_bytes: row.available_bytes,
        usage_percent: usage_percent(row.used_bytes, row.total_bytes),
    })
}

/// Parses the full `df -P -B1` listing into the storage disks: every mount
/// other than `/` and system mounts, limited to `mount_prefixes` when given.
pub fn parse_partitions(
    text: &str,
    mount_prefixes: &[String],
) -> Result<Vec<StorageDisk>, ParseError> {
    let rows = parse_df(text, Metric::Storage)?;
    let mut seen = HashSet::new();

    Ok(rows
        .into_iter()
        .filter(|r| r.mount_point != "/")
        .filter(|r| {
            !IGNORED_MOUNT_PREFIXES
                .iter()
                .any(|p| is_under_mount(&r.mount_point, p))
        })
        .filter(|r| {
            mount_prefixes.is_empty()
                || mount_prefixes
                    .iter()
                    .any(|p| is_under_mount(&r.mount_point, p))
        })
        .filter(|r| seen.insert(r.mount_point.clone()))
        .map(|r| StorageDisk {
            usage_percent: usage_percent(r.used_bytes, r.total_bytes),
            filesystem: r.filesystem,
            mount_point: r.mount_point,
            used_bytes: r.used_bytes,
            total_bytes: r.total_bytes,
            available_bytes: r.available_bytes,
        })
        .collect())
}

/// Sums the storage disks into one aggregate.
pub fn summarize_storage(disks: &[StorageDisk]) -> DiskStat {
    let used_bytes: u64 = disks.iter().map(|d| d.used_bytes).sum();
    let total_bytes: u64 = disks.iter().map(|d| d.total_bytes).sum();
    let available_bytes: u64 = disks.iter().map(|d| d.available_bytes).sum();
    DiskStat {
        used_bytes,
        total_bytes,
        available_bytes,
        usage_percent: usage_percent(used_bytes, total_bytes),
    }
}

/// Busy percentage as `100 - idle` from the `Cpu(s)` line of `top -bn1`.
///
/// Handles both `%Cpu(s):  2.0 us,  1.0 sy, ... 96.5 id,` and the older
/// `Cpu(s):  2.0%us,  1.0%sy, ... 96.5%id,` layouts.
pub fn parse_cpu_usage(text: &str) -> Result<f64, ParseError> {
    let line = text
        .lines()
        .find(|l| l.contains("Cpu(s)") || l.to_ascii_lowercase().starts_with("%cpu"))
        .ok_or_else(|| ParseError::new(Metric::Cpu, "no 'Cpu(s)' line in top output"))?;
    let (_, values) = line
        .split_once(':')
        .ok_or_else(|| ParseError::new(Metric::Cpu, format!("malformed cpu line '{line}'")))?;

    let normalized = split_cpu_fields(values);
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    let idle = tokens
        .iter()
        .position(|t| *t == "id")
        .filter(|&i| i > 0)
        .and_then(|i| parse_f64_loose(tokens[i - 1]))
        .ok_or_else(|| ParseError::new(Metric::Cpu, format!("no idle figure in '{line}'")))?;

    let busy = (100.0 - idle).clamp(0.0, 100.0);
    Ok((busy * 10.0).round() / 10.0)
}

/// Turns field separators into spaces. `top` pads with `%5.1f`, so a wide
/// figure sits right after the comma (`0.0 ni,100.0 id`). A comma between two
/// digits is a decimal comma and stays.
fn split_cpu_fields(values: &str) -> String {
    let chars: Vec<char> = values.chars().collect();
    chars
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let decimal_comma = c == ','
                && i > 0
                && chars[i - 1].is_ascii_digit()
                && chars.get(i + 1).is_some_and(char::is_ascii_digit);
            if c == '%' || (c == ',' && !decimal_comma) {
                ' '
            } else {
                c
            }
        })
        .collect()
}

/// Logical CPU count from `lscpu`, or from a bare `nproc` number.
pub fn parse_core_count(text: &str) -> Result<u32, ParseError> {
    let trimmed = text.trim();
    let count = if let Ok(n) = trimmed.parse::<u32>() {
        Some(n)
    } else {
        trimmed
            .lines()
            .find_map(|l| l.trim().strip_prefix("CPU(s):"))
            .and_then(|v| v.trim().parse::<u32>().ok())
    };

    match count {
        Some(n) if n > 0 => Ok(n),
        _ => Err(ParseError::new(Metric::Cpu, "no 'CPU(s):' count in lscpu output")),
    }
}

fn is_under_mount(mount: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    mount == prefix || mount.starts_with(&format!("{prefix}/"))
}

/// `00000000:3B:00.0` style device address. User names never contain `:`.
pub fn is_pci_bus_id(value: &str) -> bool {
    value.contains(':')
        && value.contains('.')
        && value
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.')
}

/// `nvidia-smi` placeholders for readings a device does not report.
pub fn is_not_available(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "n/a" | "[n/a]" | "[not supported]" | "not supported" | "[unknown error]" | "-"
    )
}

fn parse_optional_reading(value: &str, field: &str) -> Result<Option<f64>, ParseError> {
    if value.is_empty() || is_not_available(value) {
        return Ok(None);
    }
    parse_f64_loose(value)
        .map(Some)
        .ok_or_else(|| ParseError::new(Metric::Gpu, format!("bad {field} '{value}'")))
}

/// Leading integer of a value such as `1024` or `1024 MiB`.
pub fn parse_leading_u64(input: &str) -> Option<u64> {
    input.split_whitespace().next()?.parse::<u64>().ok()
}

pub fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    if let Ok(v) = trimmed.replace(',', ".").parse::<f64>() {
        return Some(v);
    }

    let filtered: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',' || *c == '-' || *c == '+')
        .collect();
    if filtered.is_empty() {
        return None;
    }

    filtered.replace(',', ".").parse::<f64>().ok()
}
