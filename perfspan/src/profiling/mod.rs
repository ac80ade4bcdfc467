//! Profiling core modules
//!
//! - eBPF program loading and attachment
//! - CPU utilities
//! - Drop counter diagnostics
//! - Event pairing

pub mod cpu_utils;
pub mod diagnostics;
pub mod ebpf_setup;
pub mod event_processor;

// Re-export common types
pub use cpu_utils::online_cpus;
pub use diagnostics::{print_capture_diagnostics, read_drop_counters, DropCounters};
pub use ebpf_setup::{
    attach_counters, attach_span_probes, build_engine_config, init_ebpf_logger,
    load_ebpf_program, register_span_names,
};
pub use event_processor::{EventProcessor, ProcessorStats};
