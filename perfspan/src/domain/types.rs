//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep a counter cookie from being passed where a span
//! name id is expected, and make function signatures more expressive.

use std::fmt;

/// Process ID (thread group ID in kernel terms)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

#[allow(clippy::cast_sign_loss)]
impl From<i32> for Pid {
    fn from(pid: i32) -> Self {
        Pid(pid as u32)
    }
}

#[allow(clippy::cast_possible_wrap)]
impl From<Pid> for i32 {
    fn from(pid: Pid) -> Self {
        pid.0 as i32
    }
}

/// CPU ID
///
/// Represents a CPU core ID (0, 1, 2, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU:{}", self.0)
    }
}

/// Counter cookie: position of a perf event in the `-e` list and in every record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cookie(pub u32);

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cookie#{}", self.0)
    }
}

/// Span name id: position of a span name on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NameId(pub u8);

impl NameId {
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// One span instance as seen by userspace: `(pid_tgid, span_id)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanKey {
    pub process_id: u64,
    pub span_id: u64,
}

impl SpanKey {
    /// Thread group (process) half of the combined id
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn pid(self) -> Pid {
        Pid((self.process_id >> 32) as u32)
    }

    /// Thread half of the combined id
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn tid(self) -> u32 {
        self.process_id as u32
    }
}

impl fmt::Display for SpanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.pid().0, self.tid(), self.span_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_key_splits_process_id() {
        let key = SpanKey { process_id: (1234 << 32) | 1240, span_id: 7 };
        assert_eq!(key.pid(), Pid(1234));
        assert_eq!(key.tid(), 1240);
        assert_eq!(key.to_string(), "1234/1240:7");
    }

    #[test]
    fn test_pid_round_trips_through_i32() {
        assert_eq!(i32::from(Pid::from(4321)), 4321);
    }
}
