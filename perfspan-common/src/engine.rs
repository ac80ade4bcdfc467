//! # Event Encoder/Submitter
//!
//! Runs once per span boundary marker, inside the probe handler. The handler:
//!
//! 1. Drops events from other process groups (cheapest check first)
//! 2. Copies at most [`MAX_NAME_SIZE`] bytes of the span name (enter only)
//! 3. Drops names missing from the name filter table (enter) or spans whose
//!    enter was never admitted (exit)
//! 4. Reserves one record in the event channel, fills header and counters by
//!    index, and commits it
//!
//! Nothing here blocks or retries. A full channel drops the record, raises a
//! diagnostic and reports [`ChannelFull`]; no partial record becomes visible.
//!
//! The tables, channel and probe helpers are traits so the same code drives the
//! BPF maps in the kernel and in-memory fakes in tests.

use crate::counters::CounterTable;
use crate::name::{SpanKey, SpanName};
use crate::record::{record_len, write_counter, EventKind, RecordHeader};
use crate::{EngineConfig, MAX_NAME_SIZE};

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Name filter table: span name → one-byte id, absence means "not traced"
pub trait NameFilter {
    fn lookup(&self, name: &SpanName) -> Option<u8>;
}

/// Spans whose enter record was committed, waiting for their exit
pub trait ActiveSpans {
    /// Remember an admitted span, `false` if the table refused the entry
    fn open(&self, key: &SpanKey, name_id: u8) -> bool;

    /// Forget a span, returning its name id if it was open
    fn close(&self, key: &SpanKey) -> Option<u8>;
}

/// Exclusive write handle on reserved channel space
pub trait RecordSlot {
    /// The reserved bytes, exactly as long as requested
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Publish the bytes to the consumer
    fn commit(self);
}

/// Bounded multi-producer byte queue
pub trait EventChannel {
    type Slot<'a>: RecordSlot
    where
        Self: 'a;

    /// Reserve `len` bytes, `None` when the channel is full
    fn reserve(&self, len: usize) -> Option<Self::Slot<'_>>;
}

/// Operational signal raised by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Diagnostic {
    /// A record of `len` bytes did not fit in the channel
    ChannelFull { len: usize },
    /// An enter was committed but its exit will not be matched
    SpanTableFull,
}

/// Context of the probe invocation
pub trait ProbeEnv {
    /// Combined `tgid << 32 | tid` of the current task
    fn process_id(&self) -> u64;

    /// Monotonic clock in nanoseconds
    fn now_ns(&self) -> u64;

    /// Logical CPU running the handler
    fn cpu(&self) -> u32;

    /// Copy `dst.len()` bytes from user address `src`
    ///
    /// # Errors
    /// Returns the helper's error code if the user memory cannot be read
    fn read_user(&self, src: u64, dst: &mut [u8]) -> Result<(), i64>;

    fn report(&self, diagnostic: Diagnostic);
}

// ============================================================================
// Outcomes
// ============================================================================

/// Why an event produced no record (not an error)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discard {
    ProcessGroup,
    UnreadableName,
    UnknownName,
    UntrackedSpan,
}

/// Result of a span marker that did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    Discarded(Discard),
}

/// The channel had no room; the event was dropped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelFull {
    pub len: usize,
}

// ============================================================================
// Engine
// ============================================================================

/// Span marker handlers bound to one set of tables
pub struct SpanEngine<'a, C, F, S, Q> {
    config: &'a EngineConfig,
    counters: &'a C,
    names: &'a F,
    spans: &'a S,
    channel: &'a Q,
}

impl<'a, C, F, S, Q> SpanEngine<'a, C, F, S, Q>
where
    C: CounterTable,
    F: NameFilter,
    S: ActiveSpans,
    Q: EventChannel,
{
    #[inline(always)]
    pub fn new(
        config: &'a EngineConfig,
        counters: &'a C,
        names: &'a F,
        spans: &'a S,
        channel: &'a Q,
    ) -> Self {
        Self { config, counters, names, spans, channel }
    }

    /// Handle `perfspan:enter(span_id, name_len, name_ptr)`
    ///
    /// # Errors
    /// Returns [`ChannelFull`] if the record could not be reserved.
    #[inline(always)]
    pub fn on_span_enter<E: ProbeEnv>(
        &self,
        env: &E,
        span_id: u64,
        name_len: u64,
        name_ptr: u64,
    ) -> Result<Outcome, ChannelFull> {
        let process_id = env.process_id();
        if !self.config.admits(process_id) {
            return Ok(Outcome::Discarded(Discard::ProcessGroup));
        }

        let mut name = SpanName::zeroed();
        let len = clamp_name_len(name_len);
        if env.read_user(name_ptr, &mut name.0[..len]).is_err() {
            return Ok(Outcome::Discarded(Discard::UnreadableName));
        }

        let Some(name_id) = self.names.lookup(&name) else {
            return Ok(Outcome::Discarded(Discard::UnknownName));
        };

        self.emit(env, EventKind::Enter, name_id, span_id, process_id)?;

        if !self.spans.open(&SpanKey { process_id, span_id }, name_id) {
            env.report(Diagnostic::SpanTableFull);
        }
        Ok(Outcome::Committed)
    }

    /// Handle `perfspan:exit(span_id)`
    ///
    /// Exit markers carry no name: the span is admitted only if its enter was,
    /// and the record reuses the enter's name id.
    ///
    /// # Errors
    /// Returns [`ChannelFull`] if the record could not be reserved.
    #[inline(always)]
    pub fn on_span_exit<E: ProbeEnv>(&self, env: &E, span_id: u64) -> Result<Outcome, ChannelFull> {
        let process_id = env.process_id();
        if !self.config.admits(process_id) {
            return Ok(Outcome::Discarded(Discard::ProcessGroup));
        }

        let Some(name_id) = self.spans.close(&SpanKey { process_id, span_id }) else {
            return Ok(Outcome::Discarded(Discard::UntrackedSpan));
        };

        self.emit(env, EventKind::Exit, name_id, span_id, process_id)?;
        Ok(Outcome::Committed)
    }

    #[inline(always)]
    #[allow(clippy::cast_possible_truncation)]
    fn emit<E: ProbeEnv>(
        &self,
        env: &E,
        kind: EventKind,
        name_id: u8,
        span_id: u64,
        process_id: u64,
    ) -> Result<(), ChannelFull> {
        let timestamp_ns = env.now_ns();
        let cpu = env.cpu();

        let counters = self.config.enabled_counters();
        let len = record_len(counters);
        let Some(mut slot) = self.channel.reserve(len) else {
            env.report(Diagnostic::ChannelFull { len });
            return Err(ChannelFull { len });
        };

        {
            let buf = slot.bytes_mut();
            RecordHeader { kind, name_id, cpu: cpu as u16, span_id, process_id, timestamp_ns }
                .write_to(buf);
            for cookie in 0..counters {
                write_counter(buf, cookie, self.counters.snapshot(cookie as u32));
            }
        }

        slot.commit();
        Ok(())
    }
}

#[inline(always)]
#[allow(clippy::cast_possible_truncation)]
fn clamp_name_len(claimed: u64) -> usize {
    if claimed > MAX_NAME_SIZE as u64 {
        MAX_NAME_SIZE
    } else {
        claimed as usize
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    use super::*;
    use crate::counters::accumulate_sample;
    use crate::counters::fake::FakeCounters;
    use crate::record::{EventRecord, HEADER_SIZE};
    use crate::MAX_COUNTERS;

    // ------------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct FakeNames {
        entries: HashMap<SpanName, u8>,
        lookups: Cell<usize>,
    }

    impl FakeNames {
        fn with(names: &[(&str, u8)]) -> Self {
            let entries =
                names.iter().map(|(name, id)| (SpanName::from_bytes(name.as_bytes()), *id)).collect();
            Self { entries, lookups: Cell::new(0) }
        }
    }

    impl NameFilter for FakeNames {
        fn lookup(&self, name: &SpanName) -> Option<u8> {
            self.lookups.set(self.lookups.get() + 1);
            self.entries.get(name).copied()
        }
    }

    struct FakeSpans {
        open: RefCell<HashMap<SpanKey, u8>>,
        capacity: usize,
    }

    impl Default for FakeSpans {
        fn default() -> Self {
            Self { open: RefCell::default(), capacity: usize::MAX }
        }
    }

    impl ActiveSpans for FakeSpans {
        fn open(&self, key: &SpanKey, name_id: u8) -> bool {
            let mut open = self.open.borrow_mut();
            if open.len() >= self.capacity {
                return false;
            }
            open.insert(*key, name_id);
            true
        }

        fn close(&self, key: &SpanKey) -> Option<u8> {
            self.open.borrow_mut().remove(key)
        }
    }

    /// Byte-budgeted channel; reserved space is pre-filled with garbage so
    /// tests notice any byte the engine forgets to write
    struct FakeChannel {
        capacity: usize,
        used: Cell<usize>,
        reservations: Cell<usize>,
        committed: RefCell<Vec<Vec<u8>>>,
    }

    impl FakeChannel {
        fn with_capacity(capacity: usize) -> Self {
            Self {
                capacity,
                used: Cell::new(0),
                reservations: Cell::new(0),
                committed: RefCell::default(),
            }
        }

        fn records(&self) -> Vec<EventRecord> {
            self.committed.borrow().iter().map(|bytes| EventRecord::decode(bytes).unwrap()).collect()
        }
    }

    struct FakeSlot<'a> {
        channel: &'a FakeChannel,
        bytes: Vec<u8>,
    }

    impl RecordSlot for FakeSlot<'_> {
        fn bytes_mut(&mut self) -> &mut [u8] {
            &mut self.bytes
        }

        fn commit(self) {
            self.channel.committed.borrow_mut().push(self.bytes);
        }
    }

    impl EventChannel for FakeChannel {
        type Slot<'a> = FakeSlot<'a>;

        fn reserve(&self, len: usize) -> Option<FakeSlot<'_>> {
            if self.used.get() + len > self.capacity {
                return None;
            }
            self.used.set(self.used.get() + len);
            self.reservations.set(self.reservations.get() + 1);
            Some(FakeSlot { channel: self, bytes: vec![0xAA; len] })
        }
    }

    struct FakeEnv {
        process_id: u64,
        cpu: u32,
        now: Cell<u64>,
        memory: HashMap<u64, Vec<u8>>,
        reads: Cell<usize>,
        diagnostics: RefCell<Vec<Diagnostic>>,
    }

    impl FakeEnv {
        fn new(process_group: u32) -> Self {
            Self {
                process_id: (u64::from(process_group) << 32) | u64::from(process_group + 1),
                cpu: 0,
                now: Cell::new(1_000),
                memory: HashMap::new(),
                reads: Cell::new(0),
                diagnostics: RefCell::default(),
            }
        }

        fn on_cpu(mut self, cpu: u32) -> Self {
            self.cpu = cpu;
            self
        }

        /// Place `bytes` in fake user memory, returning (len, ptr) probe args
        fn with_name(&mut self, addr: u64, bytes: &[u8]) -> (u64, u64) {
            self.memory.insert(addr, bytes.to_vec());
            (bytes.len() as u64, addr)
        }
    }

    impl ProbeEnv for FakeEnv {
        fn process_id(&self) -> u64 {
            self.process_id
        }

        fn now_ns(&self) -> u64 {
            let now = self.now.get();
            self.now.set(now + 10);
            now
        }

        fn cpu(&self) -> u32 {
            self.cpu
        }

        fn read_user(&self, src: u64, dst: &mut [u8]) -> Result<(), i64> {
            self.reads.set(self.reads.get() + 1);
            match self.memory.get(&src) {
                Some(bytes) if bytes.len() >= dst.len() => {
                    dst.copy_from_slice(&bytes[..dst.len()]);
                    Ok(())
                }
                _ => Err(-14),
            }
        }

        fn report(&self, diagnostic: Diagnostic) {
            self.diagnostics.borrow_mut().push(diagnostic);
        }
    }

    struct Fixture {
        config: EngineConfig,
        counters: FakeCounters,
        names: FakeNames,
        spans: FakeSpans,
        channel: FakeChannel,
    }

    impl Fixture {
        fn new(enabled_counters: u32, filter_process_group: u32) -> Self {
            Self {
                config: EngineConfig::new(enabled_counters, filter_process_group).unwrap(),
                counters: FakeCounters::default(),
                names: FakeNames::with(&[("db_query", 3)]),
                spans: FakeSpans::default(),
                channel: FakeChannel::with_capacity(1 << 20),
            }
        }

        fn engine(&self) -> SpanEngine<'_, FakeCounters, FakeNames, FakeSpans, FakeChannel> {
            SpanEngine::new(&self.config, &self.counters, &self.names, &self.spans, &self.channel)
        }

        /// Counter table state from the first example scenario
        fn sampled(self) -> Self {
            for period in [10, 20, 5] {
                accumulate_sample(self.counters.on_cpu(0), 0, period);
            }
            accumulate_sample(self.counters.on_cpu(0), 1, 7);
            self
        }
    }

    // ------------------------------------------------------------------------
    // Scenarios
    // ------------------------------------------------------------------------

    #[test]
    fn test_admitted_enter_commits_one_record() {
        let fx = Fixture::new(2, 0).sampled();
        let mut env = FakeEnv::new(100);
        let (len, ptr) = env.with_name(0x1000, b"db_query");

        let outcome = fx.engine().on_span_enter(&env, 42, len, ptr);
        assert_eq!(outcome, Ok(Outcome::Committed));

        let records = fx.channel.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.header.kind, EventKind::Enter);
        assert_eq!(record.header.name_id, 3);
        assert_eq!(record.header.cpu, 0);
        assert_eq!(record.header.span_id, 42);
        assert_eq!(record.header.process_id, env.process_id);
        assert_eq!(record.header.timestamp_ns, 1_000);
        assert_eq!(record.counters(), &[35, 7]);
    }

    #[test]
    fn test_unknown_name_touches_nothing() {
        let fx = Fixture::new(2, 0).sampled();
        let loads_before = fx.counters.loads.get();
        let mut env = FakeEnv::new(100);
        let (len, ptr) = env.with_name(0x1000, b"unfiltered_span");

        let outcome = fx.engine().on_span_enter(&env, 7, len, ptr);
        assert_eq!(outcome, Ok(Outcome::Discarded(Discard::UnknownName)));

        assert!(fx.channel.committed.borrow().is_empty());
        assert_eq!(fx.channel.reservations.get(), 0);
        assert_eq!(fx.counters.loads.get(), loads_before);
        assert!(env.diagnostics.borrow().is_empty());
    }

    #[test]
    fn test_exit_of_unknown_name_touches_nothing() {
        let fx = Fixture::new(2, 0);
        let mut env = FakeEnv::new(100);
        let (len, ptr) = env.with_name(0x1000, b"unfiltered_span");

        fx.engine().on_span_enter(&env, 7, len, ptr).unwrap();
        let outcome = fx.engine().on_span_exit(&env, 7);

        assert_eq!(outcome, Ok(Outcome::Discarded(Discard::UntrackedSpan)));
        assert_eq!(fx.channel.reservations.get(), 0);
    }

    #[test]
    fn test_process_group_mismatch_is_dropped_first() {
        let fx = Fixture::new(2, 1234).sampled();
        let mut env = FakeEnv::new(5555);
        let (len, ptr) = env.with_name(0x1000, b"db_query");

        let outcome = fx.engine().on_span_enter(&env, 42, len, ptr);
        assert_eq!(outcome, Ok(Outcome::Discarded(Discard::ProcessGroup)));
        assert_eq!(fx.engine().on_span_exit(&env, 42), outcome);

        assert!(fx.channel.committed.borrow().is_empty());
        assert_eq!(env.reads.get(), 0);
        assert_eq!(fx.names.lookups.get(), 0);
    }

    #[test]
    fn test_process_group_match_is_admitted() {
        let fx = Fixture::new(0, 1234);
        let mut env = FakeEnv::new(1234);
        let (len, ptr) = env.with_name(0x1000, b"db_query");

        assert_eq!(fx.engine().on_span_enter(&env, 1, len, ptr), Ok(Outcome::Committed));
        assert_eq!(fx.channel.records().len(), 1);
    }

    #[test]
    fn test_full_channel_drops_without_partial_write() {
        let mut fx = Fixture::new(2, 0).sampled();
        fx.channel = FakeChannel::with_capacity(HEADER_SIZE);
        let mut env = FakeEnv::new(100);
        let (len, ptr) = env.with_name(0x1000, b"db_query");
        let snapshot = fx.counters.values.borrow().clone();

        let outcome = fx.engine().on_span_enter(&env, 42, len, ptr);
        assert_eq!(outcome, Err(ChannelFull { len: 44 }));

        assert!(fx.channel.committed.borrow().is_empty());
        assert_eq!(fx.channel.used.get(), 0);
        assert_eq!(*fx.counters.values.borrow(), snapshot);
        assert_eq!(*env.diagnostics.borrow(), vec![Diagnostic::ChannelFull { len: 44 }]);
        // a dropped enter leaves nothing for the exit to pair with
        assert!(fx.spans.open.borrow().is_empty());
    }

    #[test]
    fn test_exit_reuses_enter_name_id() {
        let fx = Fixture::new(2, 0).sampled();
        let mut env = FakeEnv::new(100);
        let (len, ptr) = env.with_name(0x1000, b"db_query");

        fx.engine().on_span_enter(&env, 42, len, ptr).unwrap();
        accumulate_sample(fx.counters.on_cpu(0), 0, 100);
        let outcome = fx.engine().on_span_exit(&env, 42);
        assert_eq!(outcome, Ok(Outcome::Committed));

        let records = fx.channel.records();
        assert_eq!(records.len(), 2);
        let exit = &records[1];
        assert_eq!(exit.header.kind, EventKind::Exit);
        assert_eq!(exit.header.span_id, 42);
        assert_eq!(exit.header.name_id, 3);
        assert_eq!(exit.counters(), &[135, 7]);
        assert!(exit.header.timestamp_ns > records[0].header.timestamp_ns);

        // the span is closed: a second exit is not paired again
        assert_eq!(
            fx.engine().on_span_exit(&env, 42),
            Ok(Outcome::Discarded(Discard::UntrackedSpan))
        );
    }

    #[test]
    fn test_exit_is_keyed_by_thread_and_span() {
        let fx = Fixture::new(0, 0);
        let mut env = FakeEnv::new(100);
        let (len, ptr) = env.with_name(0x1000, b"db_query");
        fx.engine().on_span_enter(&env, 42, len, ptr).unwrap();

        let other = FakeEnv::new(200);
        assert_eq!(
            fx.engine().on_span_exit(&other, 42),
            Ok(Outcome::Discarded(Discard::UntrackedSpan))
        );
        assert_eq!(fx.engine().on_span_exit(&env, 42), Ok(Outcome::Committed));
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    #[test]
    fn test_every_record_carries_exactly_enabled_counters() {
        for enabled in 0..=MAX_COUNTERS as u32 {
            let fx = Fixture::new(enabled, 0);
            for cookie in 0..MAX_COUNTERS as u32 {
                accumulate_sample(fx.counters.on_cpu(0), cookie, u64::from(cookie) + 1);
            }
            let mut env = FakeEnv::new(100);
            let (len, ptr) = env.with_name(0x1000, b"db_query");

            fx.engine().on_span_enter(&env, 1, len, ptr).unwrap();
            fx.engine().on_span_exit(&env, 1).unwrap();

            let expected: Vec<u64> = (1..=u64::from(enabled)).collect();
            for record in fx.channel.records() {
                assert_eq!(record.counters(), expected.as_slice());
            }
        }
    }

    #[test]
    fn test_unsampled_cookies_are_written_as_zero() {
        let fx = Fixture::new(4, 0);
        accumulate_sample(fx.counters.on_cpu(0), 1, 9);
        let mut env = FakeEnv::new(100);
        let (len, ptr) = env.with_name(0x1000, b"db_query");

        fx.engine().on_span_enter(&env, 1, len, ptr).unwrap();
        assert_eq!(fx.channel.records()[0].counters(), &[0, 9, 0, 0]);
    }

    #[test]
    fn test_counters_come_from_the_current_cpu() {
        let fx = Fixture::new(1, 0);
        accumulate_sample(fx.counters.on_cpu(0), 0, 10);
        accumulate_sample(fx.counters.on_cpu(3), 0, 99);
        let mut env = FakeEnv::new(100).on_cpu(3);
        let (len, ptr) = env.with_name(0x1000, b"db_query");

        fx.engine().on_span_enter(&env, 1, len, ptr).unwrap();
        let record = fx.channel.records()[0];
        assert_eq!(record.header.cpu, 3);
        assert_eq!(record.counters(), &[99]);
    }

    #[test]
    fn test_long_name_matches_on_its_prefix() {
        let mut fx = Fixture::new(0, 0);
        let key = [b'k'; MAX_NAME_SIZE];
        fx.names.entries.insert(SpanName::from_bytes(&key), 9);

        let mut long = key.to_vec();
        long.extend_from_slice(b"_and_then_some");
        let mut env = FakeEnv::new(100);
        let (len, ptr) = env.with_name(0x2000, &long);

        assert_eq!(fx.engine().on_span_enter(&env, 5, len, ptr), Ok(Outcome::Committed));
        assert_eq!(fx.channel.records()[0].header.name_id, 9);
    }

    #[test]
    fn test_claimed_length_is_clamped_before_reading() {
        let mut fx = Fixture::new(0, 0);
        let key = [b'k'; MAX_NAME_SIZE];
        fx.names.entries.insert(SpanName::from_bytes(&key), 9);
        let mut env = FakeEnv::new(100);
        // only MAX_NAME_SIZE readable bytes exist behind the pointer
        let (_, ptr) = env.with_name(0x2000, &key);

        assert_eq!(fx.engine().on_span_enter(&env, 5, 1 << 40, ptr), Ok(Outcome::Committed));
    }

    #[test]
    fn test_unreadable_name_is_discarded() {
        let fx = Fixture::new(0, 0);
        let env = FakeEnv::new(100);

        assert_eq!(
            fx.engine().on_span_enter(&env, 5, 8, 0xdead),
            Ok(Outcome::Discarded(Discard::UnreadableName))
        );
        assert_eq!(fx.names.lookups.get(), 0);
    }

    #[test]
    fn test_span_table_refusal_keeps_the_record() {
        let mut fx = Fixture::new(0, 0);
        fx.spans.capacity = 0;
        let mut env = FakeEnv::new(100);
        let (len, ptr) = env.with_name(0x1000, b"db_query");

        assert_eq!(fx.engine().on_span_enter(&env, 5, len, ptr), Ok(Outcome::Committed));
        assert_eq!(fx.channel.records().len(), 1);
        assert_eq!(*env.diagnostics.borrow(), vec![Diagnostic::SpanTableFull]);
    }

    #[test]
    fn test_every_reservation_is_committed() {
        let fx = Fixture::new(3, 0).sampled();
        let mut env = FakeEnv::new(100);
        let (len, ptr) = env.with_name(0x1000, b"db_query");
        for span_id in 0..10 {
            fx.engine().on_span_enter(&env, span_id, len, ptr).unwrap();
            fx.engine().on_span_exit(&env, span_id).unwrap();
        }
        assert_eq!(fx.channel.reservations.get(), 20);
        assert_eq!(fx.channel.committed.borrow().len(), 20);
    }
}
