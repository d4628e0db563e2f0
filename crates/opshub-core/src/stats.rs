//! Typed machine stats model and command-output parsers.
//!
//! The stats collector runs a fixed set of introspection commands over a
//! cached SSH connection (`cat /proc/stat`, `cat /proc/meminfo`,
//! `df -kP`) and parses their output into a [`StatsSnapshot`] with named,
//! typed fields.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

/// Usage of one mounted filesystem, in kibibytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FsUsage {
    pub filesystem: String,
    pub mount_point: String,
    pub total_kb: u64,
    pub used_kb: u64,
    pub available_kb: u64,
}

/// Point-in-time capture of a machine's OS-level metrics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Share of CPU time spent idle, 0.0..=100.0.
    pub cpu_idle_pct: f64,
    /// Total physical memory in kibibytes.
    pub mem_total_kb: u64,
    /// Memory available for new workloads in kibibytes.
    pub mem_available_kb: u64,
    /// Per-filesystem usage.
    pub filesystems: Vec<FsUsage>,
    /// When the snapshot was collected.
    pub collected_at: DateTime<Utc>,
}

/// Parse the aggregate cpu line of `/proc/stat`.
///
/// Returns the idle share (idle + iowait over all jiffies) as a percentage.
pub fn parse_cpu_idle(proc_stat: &str) -> Result<f64> {
    let line = proc_stat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| Error::protocol("no aggregate cpu line in /proc/stat output"))?;

    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| {
            f.parse::<u64>()
                .map_err(|_| Error::protocol(format!("bad /proc/stat field: {:?}", f)))
        })
        .collect::<Result<_>>()?;

    if fields.len() < 5 {
        return Err(Error::protocol("truncated /proc/stat cpu line"));
    }

    let total: u64 = fields.iter().sum();
    if total == 0 {
        return Err(Error::protocol("zero total jiffies in /proc/stat"));
    }
    // fields: user nice system idle iowait irq softirq steal ...
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Ok(idle as f64 / total as f64 * 100.0)
}

/// Parse `MemTotal` and `MemAvailable` out of `/proc/meminfo`.
///
/// Returns (total_kb, available_kb).
pub fn parse_meminfo(meminfo: &str) -> Result<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("MemTotal:"), Some(v)) => total = v.parse().ok(),
            (Some("MemAvailable:"), Some(v)) => available = v.parse().ok(),
            _ => {}
        }
        if total.is_some() && available.is_some() {
            break;
        }
    }
    match (total, available) {
        (Some(t), Some(a)) => Ok((t, a)),
        _ => Err(Error::protocol("MemTotal/MemAvailable missing in meminfo")),
    }
}

/// Parse POSIX `df -kP` output into per-filesystem usage.
///
/// Pseudo filesystems with zero capacity are skipped.
pub fn parse_df(df_output: &str) -> Result<Vec<FsUsage>> {
    let mut usages = Vec::new();
    for line in df_output.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }
        let (Ok(total_kb), Ok(used_kb), Ok(available_kb)) = (
            fields[1].parse::<u64>(),
            fields[2].parse::<u64>(),
            fields[3].parse::<u64>(),
        ) else {
            continue;
        };
        if total_kb == 0 {
            continue;
        }
        usages.push(FsUsage {
            filesystem: fields[0].to_string(),
            // Mount point may contain spaces; rejoin the tail.
            mount_point: fields[5..].join(" "),
            total_kb,
            used_kb,
            available_kb,
        });
    }
    if usages.is_empty() {
        return Err(Error::protocol("no filesystems in df output"));
    }
    Ok(usages)
}

/// Assemble a snapshot from the three raw command outputs.
pub fn build_snapshot(proc_stat: &str, meminfo: &str, df_output: &str) -> Result<StatsSnapshot> {
    let cpu_idle_pct = parse_cpu_idle(proc_stat)?;
    let (mem_total_kb, mem_available_kb) = parse_meminfo(meminfo)?;
    let filesystems = parse_df(df_output)?;
    Ok(StatsSnapshot {
        cpu_idle_pct,
        mem_total_kb,
        mem_available_kb,
        filesystems,
        collected_at: Utc::now(),
    })
}
