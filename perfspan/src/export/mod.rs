//! Summary export
//!
//! Writes one JSON object per span with the summary statistics of its latency
//! and counter histograms, for consumption by scripts and CI.

use std::io::Write;

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::domain::ExportError;
use crate::report::SpanHistograms;

/// Summary statistics of one histogram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub metric: String,
    pub unit: String,
    pub samples: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub stdev: f64,
    pub p50: u64,
    pub p80: u64,
    pub p95: u64,
    pub p99: u64,
}

impl MetricSummary {
    fn from_histogram(metric: &str, unit: &str, hist: &Histogram<u64>) -> Self {
        Self {
            metric: metric.to_string(),
            unit: unit.to_string(),
            samples: hist.len(),
            min: hist.min(),
            max: hist.max(),
            mean: hist.mean(),
            stdev: hist.stdev(),
            p50: hist.value_at_quantile(0.5),
            p80: hist.value_at_quantile(0.8),
            p95: hist.value_at_quantile(0.95),
            p99: hist.value_at_quantile(0.99),
        }
    }
}

/// All metrics of one span name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanSummary {
    pub span: String,
    pub metrics: Vec<MetricSummary>,
}

impl From<&SpanHistograms> for SpanSummary {
    fn from(span: &SpanHistograms) -> Self {
        let mut metrics = vec![MetricSummary::from_histogram("latency", "ns", &span.latency)];
        metrics.extend(
            span.counters
                .iter()
                .map(|(event, hist)| MetricSummary::from_histogram(event.name, "events", hist)),
        );
        Self { span: span.span_name.clone(), metrics }
    }
}

/// Exports span summaries as a JSON array
pub struct SummaryExporter {
    summaries: Vec<SpanSummary>,
}

impl SummaryExporter {
    #[must_use]
    pub fn new(spans: &[SpanHistograms]) -> Self {
        Self { summaries: spans.iter().map(SpanSummary::from).collect() }
    }

    #[must_use]
    pub fn summaries(&self) -> &[SpanSummary] {
        &self.summaries
    }

    /// Write the summaries as pretty-printed JSON
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails
    pub fn export<W: Write>(&self, mut writer: W) -> Result<(), ExportError> {
        serde_json::to_writer_pretty(&mut writer, &self.summaries)?;
        writeln!(writer)?;
        writer.flush().map_err(|e| ExportError::WriteFailed(e.to_string()))
    }
}
