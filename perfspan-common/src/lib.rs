//! # Shared Data Structures and Capture Engine (eBPF ↔ Userspace)
//!
//! Everything both sides of the kernel/userspace boundary must agree on, plus the
//! span/counter capture engine itself. The engine is written against the small
//! traits in [`engine`] and [`counters`] so the same code runs inside the BPF
//! programs (bound to maps and helpers) and in host unit tests (bound to fakes).
//!
//! ## Components
//!
//! - [`counters`] - Counter Table trait and the counter aggregator
//! - [`name`] - Fixed-width span names and active-span keys
//! - [`config`] - Configuration region written once by the loader
//! - [`record`] - Wire format of the event records in the ring buffer
//! - [`engine`] - Event encoder/submitter for span enter/exit markers
//! - [`usdt`] - USDT argument location specs resolved by the loader
//!
//! ## Wire Format
//!
//! ```text
//! kind(1) name_id(1) cpu(2) span_id(8) process_id(8) timestamp(8) counters(8 * N)
//! ```
//!
//! Native byte order, no padding. `N` is the configured number of enabled
//! counters, at most [`MAX_COUNTERS`].

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod counters;
pub mod engine;
pub mod name;
pub mod record;
pub mod usdt;

pub use config::{ConfigError, EngineConfig};
pub use counters::{accumulate_sample, CounterTable};
pub use engine::{
    ActiveSpans, ChannelFull, Diagnostic, Discard, EventChannel, NameFilter, Outcome, ProbeEnv,
    RecordSlot, SpanEngine,
};
pub use name::{SpanKey, SpanName};
pub use record::{DecodeError, EventKind, EventRecord, RecordHeader};
pub use usdt::{usdt_spec_index, UsdtArg, UsdtRegisters, UsdtSpec};

// ============================================================================
// Limits
// ============================================================================

/// Width of a span name key in the name filter table
///
/// Names are zero-padded to this width. Longer names are truncated before the
/// lookup, so two names sharing their first `MAX_NAME_SIZE` bytes collide.
pub const MAX_NAME_SIZE: usize = 128;

/// Maximum number of counters carried by a single record
///
/// Also the number of counter cookies and the size of the per-CPU counter table.
/// The loader must reject configurations above this value.
pub const MAX_COUNTERS: usize = 8;

/// Maximum number of span names the loader may register in the filter table
pub const MAX_FILTERED_SPANS: u32 = 64;

/// Maximum number of concurrently open spans tracked between enter and exit
pub const MAX_ACTIVE_SPANS: u32 = 16384;

/// Ring buffer capacity in bytes (must be a power of two multiple of the page size)
pub const EVENT_CHANNEL_BYTES: u32 = 64 * 1024 * 1024;

// ============================================================================
// Probe Identification
// ============================================================================

/// USDT provider name the instrumented application uses
pub const USDT_PROVIDER: &str = "perfspan";

/// USDT probe name for span enter markers
pub const USDT_ENTER: &str = "enter";

/// USDT probe name for span exit markers
pub const USDT_EXIT: &str = "exit";

/// Probe kind of the enter marker (see [`usdt::usdt_spec_index`])
pub const PROBE_ENTER: u32 = 0;

/// Probe kind of the exit marker (see [`usdt::usdt_spec_index`])
pub const PROBE_EXIT: u32 = 1;

/// Distinct argument layouts per probe kind
///
/// Call sites of one probe can disagree on argument registers when the marker
/// is inlined into several callers. Each layout gets its own pair of uprobe
/// programs (`perfspan_enter_<slot>` / `perfspan_exit_<slot>`) and its own
/// `USDT_SPECS` entry.
pub const USDT_LAYOUT_SLOTS: u32 = 4;

/// Number of entries in the `USDT_SPECS` map
pub const USDT_SPEC_ENTRIES: u32 = 2 * USDT_LAYOUT_SLOTS;

// ============================================================================
// Diagnostics
// ============================================================================

/// Slot in the `DIAGNOSTICS` per-CPU map: records dropped because the ring buffer was full
pub const DIAG_CHANNEL_FULL: u32 = 0;

/// Slot in the `DIAGNOSTICS` per-CPU map: enters that could not be remembered for their exit
pub const DIAG_SPAN_TABLE_FULL: u32 = 1;

/// Number of slots in the `DIAGNOSTICS` map
pub const DIAG_SLOTS: u32 = 2;

// ============================================================================
// Userspace Pod impls
// ============================================================================

#[cfg(feature = "user")]
use aya::Pod;

// Pod lets aya copy these types in and out of maps and `.rodata` as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for EngineConfig {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for SpanName {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for SpanKey {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for UsdtArg {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for UsdtSpec {}
