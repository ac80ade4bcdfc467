//! # perfspan - Main Entry Point
//!
//! Loads the eBPF programs, attaches them to the span markers of the target
//! binary and to the selected perf events, then drains records until Ctrl-C,
//! the `--duration` limit or the exit of the `--pid` process, and prints one
//! latency/counter report per span.

#![allow(clippy::too_many_lines, clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use aya::maps::RingBuf;
use clap::Parser;
use log::{info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::{Duration, Instant};

use perfspan::cli::Args;
use perfspan::domain::Pid;
use perfspan::export::SummaryExporter;
use perfspan::preflight::{check_process_exists, process_alive, run_preflight_checks};
use perfspan::profiling::{
    attach_counters, attach_span_probes, build_engine_config, init_ebpf_logger,
    load_ebpf_program, print_capture_diagnostics, read_drop_counters, register_span_names,
    EventProcessor,
};
use perfspan::report::SpanHistograms;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOPERM: i32 = 77;

/// Ring buffer poll interval
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("operation not permitted") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;
    let pid = args.pid.map(Pid::from);

    // Validate everything that does not need the kernel first
    let config = build_engine_config(args.events.len(), pid)?;
    let spans = args
        .spans
        .iter()
        .map(|span| SpanHistograms::new(span.clone(), args.events.iter().cloned()))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to allocate histograms")?;

    run_preflight_checks(&args.binary, quiet)?;
    if let Some(pid) = pid {
        check_process_exists(pid)?;
    }

    if !quiet {
        println!("perfspan v{}", env!("CARGO_PKG_VERSION"));
        println!("binary: {}", args.binary.display());
        match pid {
            Some(pid) => println!("pid: {}", pid.0),
            None => println!("pid: all"),
        }
        let events: Vec<String> = args.events.iter().map(ToString::to_string).collect();
        println!("events: {}", if events.is_empty() { "none".to_string() } else { events.join(", ") });
    }

    // ── Load eBPF with the configuration region set ─────────────────────
    let mut bpf = load_ebpf_program(&args.ebpf_object, &config)?;
    init_ebpf_logger(&mut bpf);

    register_span_names(&mut bpf, &args.spans)?;
    let sites = attach_span_probes(&mut bpf, &args.binary, pid)?;
    let counter_links = attach_counters(&mut bpf, &args.events)?;
    info!("attached {sites} probe sites and {counter_links} counters");

    let mut ring_buf = RingBuf::try_from(bpf.take_map("EVENTS").context("EVENTS map not found")?)?;
    let mut processor = EventProcessor::new(spans);

    if !quiet {
        if let Some(ref export_path) = args.export {
            println!("export: {}", export_path.display());
        }
        println!("probe sites: {sites}");
        println!("capturing... (Ctrl-C to stop)");
    }

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let capture_start = Instant::now();
    let duration_limit =
        if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };
    let mut last_status_time = Instant::now();
    let mut exit_reason = "interrupted";

    loop {
        if let Some(limit) = duration_limit {
            if capture_start.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }

        if let Some(pid) = pid {
            if !process_alive(pid) {
                exit_reason = "process exited";
                break;
            }
        }

        if processor.stats.records == 0 && last_status_time.elapsed() > Duration::from_secs(10) {
            info!("Still waiting for spans... (no records received yet)");
            last_status_time = Instant::now();
        }

        while let Some(item) = ring_buf.next() {
            processor.process_bytes(&item);
        }

        tokio::select! {
            () = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = &mut ctrl_c => break,
        }
    }

    // Records committed between the last poll and the stop
    while let Some(item) = ring_buf.next() {
        processor.process_bytes(&item);
    }

    println!(); // separate ^C from the output
    if !quiet {
        eprintln!("{exit_reason}: {:.1}s", capture_start.elapsed().as_secs_f64());
    }

    match read_drop_counters(&bpf) {
        Ok(drops) => {
            if !quiet || drops.any() {
                print_capture_diagnostics(&drops, &processor.stats, processor.open_spans());
            }
        }
        Err(e) => warn!("Failed to read drop counters: {e:#}"),
    }

    let spans = processor.into_spans();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for span in &spans {
        span.print(args.buckets, &mut out)?;
    }
    out.flush()?;

    if let Some(export_path) = args.export {
        let file = File::create(&export_path)
            .with_context(|| format!("Failed to create {}", export_path.display()))?;
        SummaryExporter::new(&spans)
            .export(BufWriter::new(file))
            .context("Failed to export summary")?;
        if !quiet {
            println!("saved: {}", export_path.display());
        }
    }

    Ok(())
}
