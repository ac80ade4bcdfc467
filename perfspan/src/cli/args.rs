//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::counters::{supported_events_help, PerfEventSpec};

#[derive(Parser, Debug)]
#[command(
    name = "perfspan",
    about = "Per-span latency and hardware counter distributions for USDT-instrumented programs",
    after_help = "\
EXAMPLES:
    sudo perfspan ./app parse encode                  Latency of two spans, all processes
    sudo perfspan ./app parse -p 1234 -e cycles       Cycles per span in one process
    sudo perfspan ./app parse -e instructions=100000  Custom sample period"
)]
pub struct Args {
    /// Path to the instrumented binary
    #[arg(value_name = "BINARY")]
    pub binary: PathBuf,

    /// Span names to measure
    #[arg(value_name = "SPAN", required = true)]
    pub spans: Vec<String>,

    /// Process ID to monitor (all processes if omitted)
    #[arg(short, long)]
    pub pid: Option<i32>,

    #[arg(short, long = "event", value_name = "EVENT[=PERIOD]", help = supported_events_help())]
    pub events: Vec<PerfEventSpec>,

    /// Number of buckets in each printed distribution
    #[arg(short, long, default_value = "10", value_parser = clap::value_parser!(u64).range(1..))]
    pub buckets: u64,

    /// Stop after N seconds (0 = until Ctrl-C or target exit)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Export span summaries as JSON to file
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Path to the compiled eBPF object
    #[arg(long, value_name = "PATH", default_value = DEFAULT_EBPF_OBJECT)]
    pub ebpf_object: PathBuf,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Where `cargo xtask build-ebpf` leaves the object
pub const DEFAULT_EBPF_OBJECT: &str = "target/bpfel-unknown-none/release/perfspan";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_spans_and_events_in_order() {
        let args = Args::try_parse_from([
            "perfspan", "./app", "parse", "encode", "-e", "cycles", "-e", "cache_misses=10",
        ])
        .unwrap();
        assert_eq!(args.binary, PathBuf::from("./app"));
        assert_eq!(args.spans, vec!["parse", "encode"]);
        let names: Vec<_> = args.events.iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["cycles", "cache_misses"]);
        assert_eq!(args.events[1].sample_period, 10);
        assert_eq!(args.buckets, 10);
        assert_eq!(args.pid, None);
    }

    #[test]
    fn test_requires_at_least_one_span() {
        assert!(Args::try_parse_from(["perfspan", "./app"]).is_err());
    }

    #[test]
    fn test_rejects_unknown_event() {
        assert!(Args::try_parse_from(["perfspan", "./app", "s", "-e", "nope"]).is_err());
    }

    #[test]
    fn test_rejects_zero_buckets() {
        assert!(Args::try_parse_from(["perfspan", "./app", "s", "-b", "0"]).is_err());
    }
}
