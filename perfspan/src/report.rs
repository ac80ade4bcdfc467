//! # Per-Span Distributions
//!
//! One latency histogram and one histogram per selected perf event for every
//! span name, fed by matched enter/exit pairs and printed when capture stops.

use std::io::{self, Write};

use hdrhistogram::{iterators::IterationValue, CreationError, Histogram};
use log::debug;
use perfspan_common::EventRecord;

use crate::counters::PerfEventSpec;

/// Significant figures kept by every histogram
const SIGNIFICANT_FIGURES: u8 = 3;

/// Width of the widest distribution bar
const BAR_WIDTH: f64 = 50.0;

/// What happened to the counter deltas of one pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairOutcome {
    /// The span ended on a different CPU, so no counter deltas were recorded
    pub migrated: bool,
    /// Counters whose exit value was below the enter value
    pub regressions: usize,
}

/// Latency and counter histograms of one span name
pub struct SpanHistograms {
    pub span_name: String,
    pub latency: Histogram<u64>,
    pub counters: Vec<(PerfEventSpec, Histogram<u64>)>,
}

impl SpanHistograms {
    /// # Errors
    /// Returns an error if a histogram cannot be allocated.
    pub fn new(
        span_name: String,
        events: impl IntoIterator<Item = PerfEventSpec>,
    ) -> Result<Self, CreationError> {
        let counters = events
            .into_iter()
            .map(|event| Ok((event, Histogram::new(SIGNIFICANT_FIGURES)?)))
            .collect::<Result<Vec<_>, CreationError>>()?;
        Ok(Self { span_name, latency: Histogram::new(SIGNIFICANT_FIGURES)?, counters })
    }

    /// Record the latency and counter deltas between an enter and its exit
    ///
    /// Counter deltas are only meaningful when both records were taken on the
    /// same CPU, since the counter table is per CPU.
    pub fn record_pair(&mut self, enter: &EventRecord, exit: &EventRecord) -> PairOutcome {
        let mut outcome = PairOutcome::default();
        self.latency
            .saturating_record(exit.header.timestamp_ns.saturating_sub(enter.header.timestamp_ns));

        if exit.header.cpu != enter.header.cpu {
            debug!(
                "span {} migrated from cpu {} to {}, counters skipped",
                self.span_name, enter.header.cpu, exit.header.cpu
            );
            outcome.migrated = true;
            return outcome;
        }

        let pairs = enter.counters().iter().zip(exit.counters());
        for ((event, hist), (&before, &after)) in self.counters.iter_mut().zip(pairs) {
            if after < before {
                debug!("{} {} decreased from {before} to {after}", self.span_name, event.name);
                outcome.regressions += 1;
                continue;
            }
            hist.saturating_record(after - before);
        }
        outcome
    }

    /// Number of completed spans recorded
    #[must_use]
    pub fn samples(&self) -> u64 {
        self.latency.len()
    }

    /// Print the summary line and distribution of every metric
    ///
    /// # Errors
    /// Propagates write errors.
    pub fn print(&self, buckets: u64, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "SPAN: {}", self.span_name)?;
        print_histogram(out, &self.span_name, "latency", buckets, &self.latency, latency_label)?;
        for (event, hist) in &self.counters {
            print_histogram(out, &self.span_name, event.name, buckets, hist, counter_label)?;
        }
        Ok(())
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn print_histogram(
    out: &mut impl Write,
    span: &str,
    metric: &str,
    buckets: u64,
    hist: &Histogram<u64>,
    label: fn(u64) -> String,
) -> io::Result<()> {
    writeln!(
        out,
        "{span} {metric}: samples {} min {} max {} mean {:.2} stdev {:.2} p80 {} p95 {}",
        hist.len(),
        hist.min(),
        hist.max(),
        hist.mean(),
        hist.stdev(),
        hist.value_at_quantile(0.8),
        hist.value_at_quantile(0.95)
    )?;
    if hist.is_empty() {
        return Ok(());
    }

    let step = ((hist.max() - hist.min()) as f64 / buckets.max(1) as f64).ceil().max(1.0) as u64;
    let total = hist.len();
    for value in hist.iter_linear(step).skip_while(|v| v.quantile() < 0.01) {
        writeln!(out, "{}", distribution_row(&value, total, label))?;
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn distribution_row(value: &IterationValue<u64>, total: u64, label: fn(u64) -> String) -> String {
    let bar = (value.count_since_last_iteration() as f64 * BAR_WIDTH / total as f64).ceil() as usize;
    format!(
        "{} | {:50} | {:5.1}th %-ile",
        label(value.value_iterated_to()),
        "*".repeat(bar),
        value.percentile()
    )
}

fn latency_label(ns: u64) -> String {
    format!("{:8}µs", (ns + 1) / 1_000)
}

fn counter_label(count: u64) -> String {
    format!("{count:10}")
}
