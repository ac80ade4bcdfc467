//! Configuration region
//!
//! Written once by the loader into the BPF object's `.rodata` before load and
//! read-only afterwards. The engine receives it by reference on every invocation.

use core::fmt;

use crate::MAX_COUNTERS;

/// Process-wide engine configuration
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of counters (cookies `0..n`) appended to every record
    pub enabled_counters: u32,

    /// Process group (TGID) to admit, `0` admits every process
    pub filter_process_group: u32,
}

impl EngineConfig {
    /// Build a configuration, rejecting counts the record layout cannot carry
    ///
    /// # Errors
    /// Returns [`ConfigError::TooManyCounters`] if `enabled_counters` exceeds [`MAX_COUNTERS`]
    pub const fn new(enabled_counters: u32, filter_process_group: u32) -> Result<Self, ConfigError> {
        if enabled_counters as usize > MAX_COUNTERS {
            return Err(ConfigError::TooManyCounters { requested: enabled_counters });
        }
        Ok(Self { enabled_counters, filter_process_group })
    }

    /// Number of counters to emit, bounded by [`MAX_COUNTERS`]
    ///
    /// The bound lets the verifier prove record sizes; `new` already rejects
    /// anything larger.
    #[inline(always)]
    #[must_use]
    pub fn enabled_counters(&self) -> usize {
        let n = self.enabled_counters as usize;
        if n > MAX_COUNTERS {
            MAX_COUNTERS
        } else {
            n
        }
    }

    /// Whether an event from `process_id` passes the process-group filter
    #[inline(always)]
    #[must_use]
    pub fn admits(&self, process_id: u64) -> bool {
        self.filter_process_group == 0 || self.filter_process_group == process_group(process_id)
    }
}

/// Process group (TGID) from the combined `tgid << 32 | tid` identifier
#[inline(always)]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn process_group(process_id: u64) -> u32 {
    (process_id >> 32) as u32
}

/// Configuration rejected at the loader boundary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// More counters requested than a record can carry
    TooManyCounters { requested: u32 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyCounters { requested } => write!(
                f,
                "too many counters requested: {requested} (a record carries at most {MAX_COUNTERS})"
            ),
        }
    }
}
