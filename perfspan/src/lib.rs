//! # perfspan - Per-Span Latency and Hardware Counter Distributions
//!
//! perfspan measures how long named spans of an instrumented program take and
//! how many hardware/software events (cycles, cache misses, page faults, ...)
//! each span instance incurs. The program marks spans with two USDT probes:
//!
//! ```text
//! perfspan:enter(span_id, name_len, name_ptr)
//! perfspan:exit(span_id)
//! ```
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Instrumented Application                        │
//! │           perfspan:enter / perfspan:exit USDT sites              │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ uprobes
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     eBPF Programs (Kernel)                      │
//! │  • Perf events: on_counter_N accumulate sample periods per CPU  │
//! │  • Uprobes: perfspan_enter_N / perfspan_exit_N emit records     │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ ring buffer records
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     perfspan (This Crate)                       │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │  Profiling   │──▶│    Event     │──▶│    Report    │         │
//! │  │   (eBPF)     │   │  Processor   │   │ (histograms) │         │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘         │
//! │                                               ▼                 │
//! │                                        ┌──────────────┐         │
//! │                                        │    Export    │         │
//! │                                        │ (summary.json)│        │
//! │                                        └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`profiling`]: eBPF loading and attachment, drop counters, event pairing
//! - [`usdt`]: SDT note parsing and argument location specs
//! - [`counters`]: the `-e EVENT[=PERIOD]` perf event catalogue
//! - [`report`]: per-span hdrhistograms and their text rendering
//! - [`export`]: JSON summary export
//! - [`cli`]: command-line argument parsing
//! - [`domain`]: core domain types and errors
//! - [`preflight`]: privilege, kernel and binary checks
//!
//! ## Typical Usage
//!
//! ```bash
//! # Latency of two spans across all processes running ./app
//! sudo perfspan ./app parse encode
//!
//! # Cycles and cache misses per span in one process, exported to JSON
//! sudo perfspan ./app parse -p 1234 -e cycles -e cache_misses --export summary.json
//! ```
//!
//! ## Key Concepts
//!
//! - **Span**: a named, timed region between an enter and the exit with the same span id
//! - **Cookie**: index of a selected perf event; column of every record's counter array
//! - **Counter delta**: exit counter value minus enter counter value on the same CPU

pub mod cli;
pub mod counters;
pub mod domain;
pub mod export;
pub mod preflight;
pub mod profiling;
pub mod report;
pub mod usdt;
