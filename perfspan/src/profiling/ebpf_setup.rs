//! # eBPF Program Loading and Attachment
//!
//! Loads the compiled eBPF object and attaches programs to their hook points.
//!
//! ## Functions
//!
//! - [`load_ebpf_program()`] - Load the object with the configuration region filled in
//! - [`register_span_names()`] - Populate the `NAME_FILTER` map
//! - [`attach_span_probes()`] - Resolve USDT sites, write one `USDT_SPECS` entry per
//!   argument layout, attach uprobes
//! - [`attach_counters()`] - Open one sampling perf event per selected event and CPU
//!
//! ## Attachment Points
//!
//! - **Uprobe**: every `perfspan:enter` / `perfspan:exit` call site, through the
//!   `perfspan_enter_<slot>` / `perfspan_exit_<slot>` program of its layout
//! - **Perf Event**: `on_counter_<cookie>` on every online CPU

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use aya::{
    maps::{Array, HashMap},
    programs::{
        perf_event::{PerfEventScope, PerfTypeId, SamplePolicy},
        PerfEvent, UProbe,
    },
    Ebpf, EbpfLoader,
};
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use perfspan_common::{
    usdt_spec_index, EngineConfig, SpanName, UsdtSpec, MAX_COUNTERS, MAX_FILTERED_SPANS,
    MAX_NAME_SIZE, PROBE_ENTER, PROBE_EXIT, USDT_ENTER, USDT_EXIT, USDT_PROVIDER,
};

use crate::counters::{EventType, PerfEventSpec};
use crate::domain::{Cookie, LoaderError, Pid};
use crate::profiling::online_cpus;
use crate::usdt::{read_probes, resolve_probe, ResolvedProbe};

/// Name of the configuration region global in the eBPF object
pub const CONFIG_GLOBAL: &str = "PERFSPAN_CONFIG";

/// Arguments of `perfspan:enter(span_id, name_len, name_ptr)`
const ENTER_ARGS: usize = 3;

/// Arguments of `perfspan:exit(span_id)`
const EXIT_ARGS: usize = 1;

/// Validate the counter and process filter selection into the configuration region
///
/// # Errors
/// Returns [`LoaderError::TooManyEvents`] above [`MAX_COUNTERS`] events.
#[allow(clippy::cast_possible_truncation)]
pub fn build_engine_config(event_count: usize, pid: Option<Pid>) -> Result<EngineConfig, LoaderError> {
    if event_count > MAX_COUNTERS {
        return Err(LoaderError::TooManyEvents { requested: event_count, max: MAX_COUNTERS });
    }
    EngineConfig::new(event_count as u32, pid.map_or(0, |p| p.0))
        .map_err(|e| LoaderError::ConfigRejected(e.to_string()))
}

/// Build the `NAME_FILTER` entries: span `i` gets name id `i`
///
/// Names longer than [`MAX_NAME_SIZE`] are truncated the same way the kernel
/// side truncates the name it reads, so they still match.
///
/// # Errors
/// Returns an error for too many spans or names that collide after truncation.
#[allow(clippy::cast_possible_truncation)]
pub fn span_name_keys(spans: &[String]) -> Result<Vec<(SpanName, u8)>, LoaderError> {
    let max = (MAX_FILTERED_SPANS as usize).min(usize::from(u8::MAX) + 1);
    if spans.len() > max {
        return Err(LoaderError::TooManySpans { requested: spans.len(), max });
    }

    let mut seen = HashSet::new();
    let mut keys = Vec::with_capacity(spans.len());
    for (id, span) in spans.iter().enumerate() {
        let key = SpanName::from_bytes(span.as_bytes());
        if SpanName::truncates(span.as_bytes()) {
            warn!("Span name {span:?} is longer than {MAX_NAME_SIZE} bytes, matching on its prefix");
        }
        if !seen.insert(key.0) {
            return Err(LoaderError::DuplicateSpan { name: span.clone() });
        }
        keys.push((key, id as u8));
    }
    Ok(keys)
}

/// Load the eBPF object with the configuration region set
///
/// The object is always the release build: debug builds pull in formatting
/// code that the BPF linker rejects.
///
/// # Errors
/// Returns an error if the object cannot be read or rejected by the verifier
pub fn load_ebpf_program(path: &Path, config: &EngineConfig) -> Result<Ebpf, LoaderError> {
    EbpfLoader::new()
        .set_global(CONFIG_GLOBAL, config, true)
        .load_file(path)
        .map_err(|e| LoaderError::EbpfLoadFailed { path: path.to_path_buf(), error: e.to_string() })
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Register span names in the `NAME_FILTER` map
///
/// # Errors
/// Returns an error if the map is missing or an insert fails
pub fn register_span_names(bpf: &mut Ebpf, spans: &[String]) -> Result<usize> {
    let keys = span_name_keys(spans)?;
    let mut map: HashMap<_, SpanName, u8> =
        HashMap::try_from(bpf.map_mut("NAME_FILTER").context("NAME_FILTER map not found")?)?;
    for (key, id) in &keys {
        debug!("watching span {key:?} with id {id}");
        map.insert(key, id, 0).with_context(|| format!("Failed to register span {key:?}"))?;
    }
    info!("✓ Registered {} span names", keys.len());
    Ok(keys.len())
}

/// Program that handles call sites of layout `slot` of one probe
fn layout_program(probe_program: &str, slot: usize) -> String {
    format!("{probe_program}_{slot}")
}

/// Program that accumulates samples of counter `cookie`
fn counter_program(cookie: Cookie) -> String {
    format!("on_counter_{}", cookie.0)
}

/// Resolve the span marker probes of `binary` and attach the uprobes to every call site
///
/// Returns the number of attached sites.
///
/// # Errors
/// Returns an error if a probe is missing or has too many layouts, or attachment fails
#[allow(clippy::cast_possible_truncation)]
pub fn attach_span_probes(bpf: &mut Ebpf, binary: &Path, pid: Option<Pid>) -> Result<usize> {
    let (layout, probes) = read_probes(binary)?;
    let enter = resolve_probe(binary, layout, &probes, USDT_PROVIDER, USDT_ENTER, ENTER_ARGS)?;
    let exit = resolve_probe(binary, layout, &probes, USDT_PROVIDER, USDT_EXIT, EXIT_ARGS)?;

    {
        let mut specs: Array<_, UsdtSpec> =
            Array::try_from(bpf.map_mut("USDT_SPECS").context("USDT_SPECS map not found")?)?;
        for (kind, probe) in [(PROBE_ENTER, &enter), (PROBE_EXIT, &exit)] {
            for (slot, probe_layout) in probe.layouts.iter().enumerate() {
                specs.set(usdt_spec_index(kind, slot as u32), probe_layout.spec, 0)?;
            }
        }
    }

    let mut attached = 0;
    for (probe_program, probe) in [("perfspan_enter", &enter), ("perfspan_exit", &exit)] {
        attached += attach_probe_sites(bpf, probe_program, probe, binary, pid)?;
    }
    Ok(attached)
}

fn attach_probe_sites(
    bpf: &mut Ebpf,
    probe_program: &str,
    probe: &ResolvedProbe,
    binary: &Path,
    pid: Option<Pid>,
) -> Result<usize> {
    if probe.has_semaphore() {
        warn!(
            "{}:{} is guarded by a semaphore; sites only fire if the target enables it",
            probe.provider, probe.name
        );
    }
    if probe.layouts.len() > 1 {
        debug!(
            "{}:{} call sites use {} argument layouts",
            probe.provider,
            probe.name,
            probe.layouts.len()
        );
    }

    for (slot, probe_layout) in probe.layouts.iter().enumerate() {
        let program_name = layout_program(probe_program, slot);
        let program: &mut UProbe = bpf
            .program_mut(&program_name)
            .with_context(|| format!("{program_name} program not found"))?
            .try_into()?;
        program.load()?;

        for site in &probe_layout.sites {
            program.attach(None, site.file_offset, binary, pid.map(i32::from)).map_err(|e| {
                LoaderError::ProbeAttachFailed {
                    probe: format!("{}:{}@0x{:x}", probe.provider, probe.name, site.file_offset),
                    binary: binary.display().to_string(),
                    error: e.to_string(),
                }
            })?;
        }
        info!(
            "✓ Attached uprobe {program_name} to {} sites of {}:{} ({})",
            probe_layout.sites.len(),
            probe.provider,
            probe.name,
            probe_layout.args
        );
    }
    Ok(probe.site_count())
}

/// Attach `on_counter_<cookie>` for every selected event on every online CPU
///
/// Counters are per CPU and system wide; the span engine filters records, not samples.
///
/// # Errors
/// Returns an error if a program is missing or the event cannot be opened
#[allow(clippy::cast_possible_truncation)]
pub fn attach_counters(bpf: &mut Ebpf, events: &[PerfEventSpec]) -> Result<usize> {
    if events.is_empty() {
        return Ok(0);
    }
    let cpus = online_cpus()?;

    for (index, event) in events.iter().enumerate() {
        let cookie = Cookie(index as u32);
        let program_name = counter_program(cookie);
        let program: &mut PerfEvent = bpf
            .program_mut(&program_name)
            .with_context(|| format!("{program_name} program not found"))?
            .try_into()?;
        program.load()?;

        for cpu in &cpus {
            program
                .attach(
                    perf_type(event.event_type),
                    event.config,
                    PerfEventScope::AllProcessesOneCpu { cpu: cpu.0 },
                    SamplePolicy::Period(event.sample_period),
                    false,
                )
                .with_context(|| format!("Failed to open {event} on {cpu}"))?;
        }
        info!("✓ Attached {event} as {cookie} on {} CPUs", cpus.len());
    }
    Ok(cpus.len() * events.len())
}

fn perf_type(event_type: EventType) -> PerfTypeId {
    match event_type {
        EventType::Hardware => PerfTypeId::Hardware,
        EventType::Software => PerfTypeId::Software,
    }
}
