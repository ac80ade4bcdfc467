//! # Event Processing
//!
//! Consumes records from the eBPF ring buffer and pairs every EXIT with the
//! ENTER of the same `(process_id, span_id)`.
//!
//! ## Record Routing
//!
//! - `ENTER` → remembered until its exit arrives
//! - `EXIT` with a remembered enter → latency and counter deltas into the
//!   span's histograms
//! - `EXIT` without one → counted as unmatched (enter lost or capture started mid-span)
//!
//! Records from one CPU arrive in order, but records of different CPUs may
//! interleave arbitrarily, so pairing never assumes global ordering.

use std::collections::HashMap;

use log::{trace, warn};
use perfspan_common::{EventKind, EventRecord};

use crate::domain::{NameId, SpanKey};
use crate::report::SpanHistograms;

/// Per-record-type counters for the end-of-run summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub records: u64,
    pub enters: u64,
    pub exits: u64,
    pub paired: u64,
    pub unmatched_exits: u64,
    /// Enter that replaced a still-open enter with the same key
    pub reopened: u64,
    pub unknown_names: u64,
    pub decode_errors: u64,
    pub migrated: u64,
    pub counter_regressions: u64,
}

/// Encapsulates pairing state and the per-span histograms
pub struct EventProcessor {
    spans: Vec<SpanHistograms>,
    open: HashMap<SpanKey, EventRecord>,
    pub stats: ProcessorStats,
}

impl EventProcessor {
    /// Create a processor; `spans[i]` receives records with name id `i`
    #[must_use]
    pub fn new(spans: Vec<SpanHistograms>) -> Self {
        Self { spans, open: HashMap::new(), stats: ProcessorStats::default() }
    }

    /// Decode and process one ring buffer sample
    pub fn process_bytes(&mut self, bytes: &[u8]) {
        match EventRecord::decode(bytes) {
            Ok(record) => self.process_record(record),
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!("Dropping malformed record: {e}");
            }
        }
    }

    /// Process a single record
    pub fn process_record(&mut self, record: EventRecord) {
        self.stats.records += 1;
        let header = record.header;
        let key = SpanKey { process_id: header.process_id, span_id: header.span_id };

        if NameId(header.name_id).index() >= self.spans.len() {
            self.stats.unknown_names += 1;
            warn!("Record for unknown span name id {}", header.name_id);
            return;
        }

        match header.kind {
            EventKind::Enter => {
                self.stats.enters += 1;
                if self.open.insert(key, record).is_some() {
                    self.stats.reopened += 1;
                    trace!("span {key} entered again before its exit");
                }
            }
            EventKind::Exit => {
                self.stats.exits += 1;
                let Some(enter) = self.open.remove(&key) else {
                    self.stats.unmatched_exits += 1;
                    trace!("missed opening event for span {key}");
                    return;
                };
                let span = &mut self.spans[NameId(enter.header.name_id).index()];
                let outcome = span.record_pair(&enter, &record);
                self.stats.paired += 1;
                self.stats.migrated += u64::from(outcome.migrated);
                self.stats.counter_regressions += outcome.regressions as u64;
            }
        }
    }

    /// Spans entered but not yet exited
    #[must_use]
    pub fn open_spans(&self) -> usize {
        self.open.len()
    }

    #[must_use]
    pub fn spans(&self) -> &[SpanHistograms] {
        &self.spans
    }

    /// Hand the histograms over for reporting
    #[must_use]
    pub fn into_spans(self) -> Vec<SpanHistograms> {
        self.spans
    }
}
