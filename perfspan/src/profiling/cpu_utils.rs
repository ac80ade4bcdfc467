//! CPU utility functions
//!
//! Counters are opened once per online CPU, read from sysfs.

use anyhow::{Context, Result};
use std::fs;

use crate::domain::CpuId;

const ONLINE_CPUS: &str = "/sys/devices/system/cpu/online";

/// Get list of online CPU IDs
///
/// # Errors
/// Returns an error if sysfs cannot be read or holds an unexpected format.
pub fn online_cpus() -> Result<Vec<CpuId>> {
    let content = fs::read_to_string(ONLINE_CPUS).with_context(|| format!("Failed to read {ONLINE_CPUS}"))?;
    parse_cpu_list(&content).with_context(|| format!("Unexpected contents of {ONLINE_CPUS}: {content:?}"))
}

/// Parse a kernel CPU list such as `0-3,8-11,16`
///
/// # Errors
/// Returns an error for malformed entries or descending ranges.
pub fn parse_cpu_list(list: &str) -> Result<Vec<CpuId>> {
    let mut cpus = Vec::new();
    for entry in list.trim().split(',').filter(|e| !e.is_empty()) {
        match entry.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.parse()?;
                let end: u32 = end.parse()?;
                anyhow::ensure!(start <= end, "descending CPU range {entry}");
                cpus.extend((start..=end).map(CpuId));
            }
            None => cpus.push(CpuId(entry.parse()?)),
        }
    }
    Ok(cpus)
}
