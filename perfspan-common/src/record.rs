//! # Event Record Wire Format
//!
//! Every record is a fixed 28-byte header followed by `enabled_counters`
//! cumulative counter values in cookie order. Fields sit at fixed offsets and are
//! written by index, never through a walking cursor, so the maximum layout
//! ([`MAX_RECORD_SIZE`]) is known at compile time.
//!
//! The record length alone tells the consumer how many counters follow: the ring
//! buffer preserves the reserved length of each sample.

use core::fmt;

use crate::MAX_COUNTERS;

pub const KIND_OFFSET: usize = 0;
pub const NAME_ID_OFFSET: usize = 1;
pub const CPU_OFFSET: usize = 2;
pub const SPAN_ID_OFFSET: usize = 4;
pub const PROCESS_ID_OFFSET: usize = 12;
pub const TIMESTAMP_OFFSET: usize = 20;
pub const COUNTERS_OFFSET: usize = 28;

/// Size of the fixed record header
pub const HEADER_SIZE: usize = COUNTERS_OFFSET;

/// Size of one counter value
pub const COUNTER_SIZE: usize = 8;

/// Largest record the engine can emit
pub const MAX_RECORD_SIZE: usize = HEADER_SIZE + COUNTER_SIZE * MAX_COUNTERS;

/// Wire length of a record carrying `counters` counter values
#[inline(always)]
#[must_use]
pub const fn record_len(counters: usize) -> usize {
    HEADER_SIZE + COUNTER_SIZE * counters
}

/// Span boundary a record describes
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Enter = 0,
    Exit = 1,
}

impl EventKind {
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Enter),
            1 => Some(Self::Exit),
            _ => None,
        }
    }
}

/// Header fields of a record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: EventKind,
    pub name_id: u8,
    pub cpu: u16,
    pub span_id: u64,
    pub process_id: u64,
    pub timestamp_ns: u64,
}

impl RecordHeader {
    /// Write the header into the first [`HEADER_SIZE`] bytes of `buf`
    ///
    /// Does nothing if `buf` is shorter than a header.
    #[inline(always)]
    pub fn write_to(&self, buf: &mut [u8]) {
        let Some(header) = buf.get_mut(..HEADER_SIZE) else {
            return;
        };
        header[KIND_OFFSET] = self.kind as u8;
        header[NAME_ID_OFFSET] = self.name_id;
        header[CPU_OFFSET..SPAN_ID_OFFSET].copy_from_slice(&self.cpu.to_ne_bytes());
        header[SPAN_ID_OFFSET..PROCESS_ID_OFFSET].copy_from_slice(&self.span_id.to_ne_bytes());
        header[PROCESS_ID_OFFSET..TIMESTAMP_OFFSET]
            .copy_from_slice(&self.process_id.to_ne_bytes());
        header[TIMESTAMP_OFFSET..COUNTERS_OFFSET]
            .copy_from_slice(&self.timestamp_ns.to_ne_bytes());
    }
}

/// Write counter `cookie` of a record
///
/// Out-of-range cookies or short buffers are ignored.
#[inline(always)]
pub fn write_counter(buf: &mut [u8], cookie: usize, value: u64) {
    if cookie >= MAX_COUNTERS {
        return;
    }
    let start = COUNTERS_OFFSET + cookie * COUNTER_SIZE;
    if let Some(slot) = buf.get_mut(start..start + COUNTER_SIZE) {
        slot.copy_from_slice(&value.to_ne_bytes());
    }
}

/// A record read back from the ring buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub header: RecordHeader,
    counters: [u64; MAX_COUNTERS],
    counter_count: u8,
}

impl EventRecord {
    /// Decode one ring buffer sample
    ///
    /// # Errors
    /// Returns a [`DecodeError`] if the length is not a header plus whole
    /// counters, carries more than [`MAX_COUNTERS`] counters, or the kind is unknown.
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated { len: bytes.len() });
        }
        let tail = bytes.len() - HEADER_SIZE;
        if tail % COUNTER_SIZE != 0 {
            return Err(DecodeError::Misaligned { len: bytes.len() });
        }
        let counter_count = tail / COUNTER_SIZE;
        if counter_count > MAX_COUNTERS {
            return Err(DecodeError::TooManyCounters { count: counter_count });
        }
        let kind = EventKind::from_u8(bytes[KIND_OFFSET])
            .ok_or(DecodeError::UnknownKind(bytes[KIND_OFFSET]))?;

        let header = RecordHeader {
            kind,
            name_id: bytes[NAME_ID_OFFSET],
            cpu: u16::from_ne_bytes([bytes[CPU_OFFSET], bytes[CPU_OFFSET + 1]]),
            span_id: read_u64(bytes, SPAN_ID_OFFSET),
            process_id: read_u64(bytes, PROCESS_ID_OFFSET),
            timestamp_ns: read_u64(bytes, TIMESTAMP_OFFSET),
        };

        let mut counters = [0u64; MAX_COUNTERS];
        for (cookie, value) in counters.iter_mut().enumerate().take(counter_count) {
            *value = read_u64(bytes, COUNTERS_OFFSET + cookie * COUNTER_SIZE);
        }

        Ok(Self { header, counters, counter_count: counter_count as u8 })
    }

    /// Counter values in cookie order
    #[must_use]
    pub fn counters(&self) -> &[u64] {
        &self.counters[..self.counter_count as usize]
    }
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_ne_bytes(raw)
}

/// Why a ring buffer sample is not a valid record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    Truncated { len: usize },
    Misaligned { len: usize },
    TooManyCounters { count: usize },
    UnknownKind(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { len } => {
                write!(f, "record of {len} bytes is shorter than the {HEADER_SIZE}-byte header")
            }
            Self::Misaligned { len } => {
                write!(f, "record of {len} bytes does not end on a counter boundary")
            }
            Self::TooManyCounters { count } => {
                write!(f, "record carries {count} counters, at most {MAX_COUNTERS} supported")
            }
            Self::UnknownKind(kind) => write!(f, "unknown event kind {kind}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> RecordHeader {
        RecordHeader {
            kind: EventKind::Exit,
            name_id: 3,
            cpu: 5,
            span_id: 42,
            process_id: (1234 << 32) | 1240,
            timestamp_ns: 987_654_321,
        }
    }

    #[test]
    fn test_header_layout_has_no_padding() {
        let mut buf = [0u8; HEADER_SIZE];
        sample_header().write_to(&mut buf);
        assert_eq!(buf[0], 1);
        assert_eq!(buf[1], 3);
        assert_eq!(&buf[2..4], &5u16.to_ne_bytes());
        assert_eq!(&buf[4..12], &42u64.to_ne_bytes());
        assert_eq!(&buf[12..20], &((1234u64 << 32) | 1240).to_ne_bytes());
        assert_eq!(&buf[20..28], &987_654_321u64.to_ne_bytes());
    }

    #[test]
    fn test_record_len() {
        assert_eq!(record_len(0), 28);
        assert_eq!(record_len(2), 44);
        assert_eq!(MAX_RECORD_SIZE, 28 + 8 * MAX_COUNTERS);
    }

    #[test]
    fn test_decode_counts_counters_from_length() {
        let mut buf = [0u8; MAX_RECORD_SIZE];
        sample_header().write_to(&mut buf);
        write_counter(&mut buf, 0, 35);
        write_counter(&mut buf, 1, 7);

        let record = EventRecord::decode(&buf[..record_len(2)]).unwrap();
        assert_eq!(record.header, sample_header());
        assert_eq!(record.counters(), &[35, 7]);
    }

    #[test]
    fn test_write_counter_ignores_out_of_range_cookie() {
        let mut buf = [0u8; MAX_RECORD_SIZE];
        write_counter(&mut buf, MAX_COUNTERS, u64::MAX);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_rejects_short_sample() {
        assert_eq!(EventRecord::decode(&[0u8; 10]), Err(DecodeError::Truncated { len: 10 }));
    }

    #[test]
    fn test_decode_rejects_partial_counter() {
        let buf = [0u8; HEADER_SIZE + 4];
        assert_eq!(EventRecord::decode(&buf), Err(DecodeError::Misaligned { len: 32 }));
    }

    #[test]
    fn test_decode_rejects_oversized_sample() {
        let buf = [0u8; MAX_RECORD_SIZE + COUNTER_SIZE];
        assert_eq!(
            EventRecord::decode(&buf),
            Err(DecodeError::TooManyCounters { count: MAX_COUNTERS + 1 })
        );
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[KIND_OFFSET] = 7;
        assert_eq!(EventRecord::decode(&buf), Err(DecodeError::UnknownKind(7)));
    }
}
