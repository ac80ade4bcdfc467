//! Drop counters kept by the eBPF side
//!
//! Records are never retried: a full ring buffer or a full active span table
//! only bumps a per-CPU counter, read back here when capture stops.

use anyhow::{Context, Result};
use aya::maps::PerCpuArray;
use aya::Ebpf;
use perfspan_common::{DIAG_CHANNEL_FULL, DIAG_SPAN_TABLE_FULL};

use super::event_processor::ProcessorStats;

/// Totals of the `DIAGNOSTICS` map across all CPUs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounters {
    /// Records dropped because the ring buffer had no room
    pub channel_full: u64,
    /// Enters whose exit could not be tracked
    pub span_table_full: u64,
}

impl DropCounters {
    #[must_use]
    pub fn any(&self) -> bool {
        self.channel_full > 0 || self.span_table_full > 0
    }
}

/// Sum the per-CPU drop counters
///
/// # Errors
/// Returns an error if the `DIAGNOSTICS` map cannot be accessed
pub fn read_drop_counters(bpf: &Ebpf) -> Result<DropCounters> {
    let map: PerCpuArray<_, u64> =
        PerCpuArray::try_from(bpf.map("DIAGNOSTICS").context("DIAGNOSTICS map not found")?)?;
    let total = |slot: u32| -> Result<u64> {
        let values = map.get(&slot, 0).with_context(|| format!("Failed to read DIAGNOSTICS[{slot}]"))?;
        Ok(values.iter().sum())
    };
    Ok(DropCounters {
        channel_full: total(DIAG_CHANNEL_FULL)?,
        span_table_full: total(DIAG_SPAN_TABLE_FULL)?,
    })
}

/// Print drop counters and pairing statistics
pub fn print_capture_diagnostics(drops: &DropCounters, stats: &ProcessorStats, open_spans: usize) {
    eprintln!(
        "records: {} (enter: {}, exit: {}, paired: {}, still open: {open_spans})",
        stats.records, stats.enters, stats.exits, stats.paired
    );
    if drops.any() {
        eprintln!(
            "warning: kernel dropped {} records (ring buffer full) and lost {} span exits (span table full)",
            drops.channel_full, drops.span_table_full
        );
    }
    if stats.unmatched_exits > 0 {
        eprintln!("warning: {} exits without a matching enter", stats.unmatched_exits);
    }
    if stats.migrated > 0 || stats.counter_regressions > 0 {
        eprintln!(
            "note: counters skipped for {} spans that migrated CPUs and {} decreasing readings",
            stats.migrated, stats.counter_regressions
        );
    }
    if stats.unknown_names > 0 || stats.decode_errors > 0 {
        eprintln!(
            "warning: {} records with unknown span ids, {} malformed records",
            stats.unknown_names, stats.decode_errors
        );
    }
}
