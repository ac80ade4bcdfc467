//! # eBPF Kernel-Side Span/Counter Capture
//!
//! Binds the engine in `perfspan-common` to BPF maps and helpers.
//!
//! ## Programs
//!
//! - **Perf Event**: `on_counter_0` .. `on_counter_7` - counter aggregator, one
//!   program per cookie (the loader attaches counter `i` to `on_counter_i`)
//! - **Uprobe**: `perfspan_enter_0` .. `perfspan_enter_3` -
//!   `perfspan:enter(span_id, name_len, name_ptr)` USDT sites, one program per
//!   distinct argument layout
//! - **Uprobe**: `perfspan_exit_0` .. `perfspan_exit_3` - `perfspan:exit(span_id)` USDT sites
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer (64MB) carrying event records
//! - `COUNTERS` - Per-CPU cumulative sample periods by cookie
//! - `NAME_FILTER` - Span name → name id, populated by userspace
//! - `ACTIVE_SPANS` - Spans between an admitted enter and its exit
//! - `USDT_SPECS` - Argument locations of the enter/exit probes, one per layout slot
//! - `DIAGNOSTICS` - Per-CPU drop counters
//!
//! The configuration region is the `PERFSPAN_CONFIG` global in `.rodata`, set by
//! the loader before load.
//!
//! ## Build
//!
//! Always compiled in release mode:
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    bindings::bpf_perf_event_data,
    cty::c_void,
    helpers::{
        bpf_get_current_pid_tgid, bpf_get_smp_processor_id, bpf_ktime_get_ns,
        bpf_probe_read_kernel, bpf_probe_read_user_buf,
        gen::{bpf_ringbuf_reserve, bpf_ringbuf_submit},
    },
    macros::{map, perf_event, uprobe},
    maps::{Array, HashMap, LruHashMap, PerCpuArray, RingBuf},
    programs::{PerfEventContext, ProbeContext},
    EbpfContext,
};
use aya_log_ebpf::warn;
use perfspan_common::{
    accumulate_sample,
    usdt::{UsdtRegisters, EINVAL},
    usdt_spec_index, ActiveSpans, CounterTable, Diagnostic, EngineConfig, EventChannel,
    NameFilter, ProbeEnv, RecordSlot, SpanEngine, SpanKey, SpanName, UsdtSpec,
    DIAG_CHANNEL_FULL, DIAG_SLOTS, DIAG_SPAN_TABLE_FULL, EVENT_CHANNEL_BYTES, MAX_ACTIVE_SPANS,
    MAX_COUNTERS, MAX_FILTERED_SPANS, PROBE_ENTER, PROBE_EXIT, USDT_LAYOUT_SLOTS,
    USDT_SPEC_ENTRIES,
};

// ============================================================================
// Configuration Region
// ============================================================================

/// Written by the loader with `EbpfLoader::set_global` before load, frozen afterwards
///
/// Read through `read_volatile` so the compiler cannot fold the zero initializer.
#[no_mangle]
static PERFSPAN_CONFIG: EngineConfig = EngineConfig { enabled_counters: 0, filter_process_group: 0 };

#[inline(always)]
fn load_config() -> EngineConfig {
    unsafe { core::ptr::read_volatile(&PERFSPAN_CONFIG) }
}

// ============================================================================
// eBPF Maps
// ============================================================================

/// Event channel: multi-producer ring buffer drained by userspace
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(EVENT_CHANNEL_BYTES, 0);

/// Counter table: cookie → cumulative sample period, one slice per CPU
#[map]
static COUNTERS: PerCpuArray<u64> = PerCpuArray::with_max_entries(MAX_COUNTERS as u32, 0);

/// Name filter table: zero-padded span name → name id
#[map]
static NAME_FILTER: HashMap<SpanName, u8> = HashMap::with_max_entries(MAX_FILTERED_SPANS, 0);

/// Active spans: (pid_tgid, span_id) → name id of the admitted enter
///
/// LRU so spans whose exit never fires (killed threads) age out.
#[map]
static ACTIVE_SPANS: LruHashMap<SpanKey, u8> = LruHashMap::with_max_entries(MAX_ACTIVE_SPANS, 0);

/// USDT argument specs indexed by `usdt_spec_index(probe, slot)`
#[map]
static USDT_SPECS: Array<UsdtSpec> = Array::with_max_entries(USDT_SPEC_ENTRIES, 0);

/// Drop counters indexed by `DIAG_*`
#[map]
static DIAGNOSTICS: PerCpuArray<u64> = PerCpuArray::with_max_entries(DIAG_SLOTS, 0);

// ============================================================================
// Engine Bindings
// ============================================================================

struct MapCounters;

impl CounterTable for MapCounters {
    #[inline(always)]
    fn load(&self, cookie: u32) -> Option<u64> {
        unsafe { COUNTERS.get(cookie).copied() }
    }

    #[inline(always)]
    fn store(&self, cookie: u32, value: u64) {
        if let Some(slot) = unsafe { COUNTERS.get_ptr_mut(cookie) } {
            unsafe { *slot = value };
        }
    }
}

struct MapNames;

impl NameFilter for MapNames {
    #[inline(always)]
    fn lookup(&self, name: &SpanName) -> Option<u8> {
        unsafe { NAME_FILTER.get(name).copied() }
    }
}

struct MapSpans;

impl ActiveSpans for MapSpans {
    #[inline(always)]
    fn open(&self, key: &SpanKey, name_id: u8) -> bool {
        ACTIVE_SPANS.insert(key, &name_id, 0).is_ok()
    }

    #[inline(always)]
    fn close(&self, key: &SpanKey) -> Option<u8> {
        let name_id = unsafe { ACTIVE_SPANS.get(key).copied() }?;
        let _ = ACTIVE_SPANS.remove(key);
        Some(name_id)
    }
}

/// Reserve/commit on `EVENTS` with a runtime length
///
/// aya's typed `reserve::<T>()` only reserves `size_of::<T>()`. The length comes
/// from the frozen `.rodata` config, so the verifier still sees a constant.
struct EventRing;

struct RingSlot {
    data: *mut u8,
    len: usize,
}

impl RecordSlot for RingSlot {
    #[inline(always)]
    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.data, self.len) }
    }

    #[inline(always)]
    fn commit(self) {
        unsafe { bpf_ringbuf_submit(self.data.cast::<c_void>(), 0) };
    }
}

impl EventChannel for EventRing {
    type Slot<'a> = RingSlot;

    #[inline(always)]
    fn reserve(&self, len: usize) -> Option<RingSlot> {
        // SAFETY: RingBuf is a transparent wrapper around its map definition,
        // which is what the helper expects as the map argument.
        let data = unsafe {
            bpf_ringbuf_reserve(
                core::ptr::addr_of!(EVENTS).cast_mut().cast::<c_void>(),
                len as u64,
                0,
            )
        };
        if data.is_null() {
            return None;
        }
        Some(RingSlot { data: data.cast::<u8>(), len })
    }
}

struct KernelEnv<'a> {
    ctx: &'a ProbeContext,
}

impl ProbeEnv for KernelEnv<'_> {
    #[inline(always)]
    fn process_id(&self) -> u64 {
        unsafe { bpf_get_current_pid_tgid() }
    }

    #[inline(always)]
    fn now_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }

    #[inline(always)]
    fn cpu(&self) -> u32 {
        unsafe { bpf_get_smp_processor_id() }
    }

    #[inline(always)]
    fn read_user(&self, src: u64, dst: &mut [u8]) -> Result<(), i64> {
        if dst.is_empty() {
            return Ok(());
        }
        unsafe { bpf_probe_read_user_buf(src as *const u8, dst) }.map_err(|e| e as i64)
    }

    #[inline(always)]
    fn report(&self, diagnostic: Diagnostic) {
        match diagnostic {
            Diagnostic::ChannelFull { len } => {
                warn!(self.ctx, "ringbuf reserve of {} bytes failed, record dropped", len);
                bump_diagnostic(DIAG_CHANNEL_FULL);
            }
            Diagnostic::SpanTableFull => {
                warn!(self.ctx, "active span table rejected an entry, exit will be lost");
                bump_diagnostic(DIAG_SPAN_TABLE_FULL);
            }
        }
    }
}

#[inline(always)]
fn bump_diagnostic(slot: u32) {
    if let Some(count) = unsafe { DIAGNOSTICS.get_ptr_mut(slot) } {
        unsafe { *count += 1 };
    }
}

/// Register file of the task that hit the USDT site
struct Registers<'a>(&'a ProbeContext);

impl UsdtRegisters for Registers<'_> {
    #[inline(always)]
    fn read_register(&self, offset: u32) -> Result<u64, i64> {
        let regs = self.0.regs as *const u8;
        unsafe { bpf_probe_read_kernel(regs.add(offset as usize) as *const u64) }
            .map_err(|e| e as i64)
    }

    #[inline(always)]
    fn read_user(&self, addr: u64, dst: &mut [u8]) -> Result<(), i64> {
        unsafe { bpf_probe_read_user_buf(addr as *const u8, dst) }.map_err(|e| e as i64)
    }
}

// ============================================================================
// Counter Aggregator Programs
// ============================================================================

const _: () = assert!(MAX_COUNTERS == 8, "one on_counter_N program per cookie");

macro_rules! counter_programs {
    ($($name:ident => $cookie:expr),* $(,)?) => {
        $(
            /// Counter overflow sample for one fixed cookie
            #[perf_event]
            pub fn $name(ctx: PerfEventContext) -> u32 {
                on_counter_sample(&ctx, $cookie);
                0
            }
        )*
    };
}

counter_programs! {
    on_counter_0 => 0,
    on_counter_1 => 1,
    on_counter_2 => 2,
    on_counter_3 => 3,
    on_counter_4 => 4,
    on_counter_5 => 5,
    on_counter_6 => 6,
    on_counter_7 => 7,
}

#[inline(always)]
fn on_counter_sample(ctx: &PerfEventContext, cookie: u32) {
    let data = ctx.as_ptr() as *const bpf_perf_event_data;
    let sample_period = unsafe { (*data).sample_period };
    accumulate_sample(&MapCounters, cookie, sample_period);
}

// ============================================================================
// Span Marker Programs
// ============================================================================

const _: () = assert!(USDT_LAYOUT_SLOTS == 4, "one perfspan_enter_N/perfspan_exit_N pair per slot");

macro_rules! span_programs {
    ($($enter:ident, $exit:ident => $slot:expr),* $(,)?) => {
        $(
            /// Hook: `perfspan:enter(span_id, name_len, name_ptr)` sites of one argument layout
            #[uprobe]
            pub fn $enter(ctx: ProbeContext) -> u32 {
                match try_span_enter(&ctx, $slot) {
                    Ok(()) => 0,
                    Err(_) => 1,
                }
            }

            /// Hook: `perfspan:exit(span_id)` sites of one argument layout
            #[uprobe]
            pub fn $exit(ctx: ProbeContext) -> u32 {
                match try_span_exit(&ctx, $slot) {
                    Ok(()) => 0,
                    Err(_) => 1,
                }
            }
        )*
    };
}

span_programs! {
    perfspan_enter_0, perfspan_exit_0 => 0,
    perfspan_enter_1, perfspan_exit_1 => 1,
    perfspan_enter_2, perfspan_exit_2 => 2,
    perfspan_enter_3, perfspan_exit_3 => 3,
}

fn try_span_enter(ctx: &ProbeContext, slot: u32) -> Result<(), i64> {
    let spec = unsafe { USDT_SPECS.get(usdt_spec_index(PROBE_ENTER, slot)) }.ok_or(EINVAL)?;
    let regs = Registers(ctx);
    let span_id = spec.arg(&regs, 0)?;
    let name_len = spec.arg(&regs, 1)?;
    let name_ptr = spec.arg(&regs, 2)?;

    let config = load_config();
    SpanEngine::new(&config, &MapCounters, &MapNames, &MapSpans, &EventRing)
        .on_span_enter(&KernelEnv { ctx }, span_id, name_len, name_ptr)
        .map_err(|_| 1i64)?;
    Ok(())
}

fn try_span_exit(ctx: &ProbeContext, slot: u32) -> Result<(), i64> {
    let spec = unsafe { USDT_SPECS.get(usdt_spec_index(PROBE_EXIT, slot)) }.ok_or(EINVAL)?;
    let span_id = spec.arg(&Registers(ctx), 0)?;

    let config = load_config();
    SpanEngine::new(&config, &MapCounters, &MapNames, &MapSpans, &EventRing)
        .on_span_exit(&KernelEnv { ctx }, span_id)
        .map_err(|_| 1i64)?;
    Ok(())
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
