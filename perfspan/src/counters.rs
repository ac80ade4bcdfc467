//! # Perf Event Selection
//!
//! The `-e EVENT[=PERIOD]` values. Each selected event becomes one counter
//! cookie, in command-line order, and one column of every record.

use std::fmt;
use std::str::FromStr;

use aya::programs::perf_event::{perf_hw_id, perf_sw_ids};
use thiserror::Error;

/// Perf event family, mapped to `PerfTypeId` when attaching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Hardware,
    Software,
}

/// A supported perf event with its sample period
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PerfEventSpec {
    pub name: &'static str,
    pub event_type: EventType,
    pub config: u64,
    pub sample_period: u64,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EventSpecError {
    #[error("missing event name")]
    MissingName,

    #[error("unknown event name: {0} (supported: {list})", list = supported_names())]
    UnknownEvent(String),

    #[error("invalid sample period {0:?}, expected a positive integer")]
    InvalidPeriod(String),
}

macro_rules! hw {
    ($name:literal, $id:ident, $period:expr) => {
        PerfEventSpec {
            name: $name,
            event_type: EventType::Hardware,
            config: perf_hw_id::$id as u64,
            sample_period: $period,
        }
    };
}

macro_rules! sw {
    ($name:literal, $id:ident, $period:expr) => {
        PerfEventSpec {
            name: $name,
            event_type: EventType::Software,
            config: perf_sw_ids::$id as u64,
            sample_period: $period,
        }
    };
}

/// Events accepted by `-e`, with their default sample periods
pub const SUPPORTED_PERF_EVENTS: &[PerfEventSpec] = &[
    hw!("cycles", PERF_COUNT_HW_CPU_CYCLES, 10_000_000),
    hw!("instructions", PERF_COUNT_HW_INSTRUCTIONS, 10_000_000),
    hw!("cache_references", PERF_COUNT_HW_CACHE_REFERENCES, 1_000),
    hw!("cache_misses", PERF_COUNT_HW_CACHE_MISSES, 1_000),
    hw!("branch_instructions", PERF_COUNT_HW_BRANCH_INSTRUCTIONS, 1_000_000),
    hw!("branch_misses", PERF_COUNT_HW_BRANCH_MISSES, 1_000_000),
    hw!("bus_cycles", PERF_COUNT_HW_BUS_CYCLES, 1_000_000),
    hw!("stalled_cycles_frontend", PERF_COUNT_HW_STALLED_CYCLES_FRONTEND, 1_000_000),
    hw!("stalled_cycles_backend", PERF_COUNT_HW_STALLED_CYCLES_BACKEND, 1_000_000),
    hw!("ref_cpu_cycles", PERF_COUNT_HW_REF_CPU_CYCLES, 1_000_000),
    // Software clocks count nanoseconds
    sw!("cpu_clock", PERF_COUNT_SW_CPU_CLOCK, 1_000_000),
    sw!("task_clock", PERF_COUNT_SW_TASK_CLOCK, 1_000_000),
    sw!("page_faults", PERF_COUNT_SW_PAGE_FAULTS, 1),
    sw!("context_switches", PERF_COUNT_SW_CONTEXT_SWITCHES, 1),
    sw!("cpu_migrations", PERF_COUNT_SW_CPU_MIGRATIONS, 1),
];

fn supported_names() -> String {
    SUPPORTED_PERF_EVENTS.iter().map(|e| e.name).collect::<Vec<_>>().join(", ")
}

/// Help text listing every supported event, for `--help`
#[must_use]
pub fn supported_events_help() -> String {
    let mut help = String::from("Perf event to count per span, as NAME or NAME=PERIOD\n\nsupported events:\n");
    for event in SUPPORTED_PERF_EVENTS {
        help.push_str(&format!("  {event}\n"));
    }
    help.push_str("the period after '=' is optional; the default is shown above");
    help
}

impl FromStr for PerfEventSpec {
    type Err = EventSpecError;

    /// Parses `name` or `name=period` into one of the supported events
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, period) = match s.split_once('=') {
            Some((name, period)) => (name, Some(period)),
            None => (s, None),
        };
        if name.is_empty() {
            return Err(EventSpecError::MissingName);
        }

        let mut spec = SUPPORTED_PERF_EVENTS
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| EventSpecError::UnknownEvent(name.to_string()))?;

        if let Some(period) = period {
            spec.sample_period = period
                .parse()
                .ok()
                .filter(|&p: &u64| p > 0)
                .ok_or_else(|| EventSpecError::InvalidPeriod(period.to_string()))?;
        }
        Ok(spec)
    }
}

impl fmt::Display for PerfEventSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.sample_period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uses_default_period() {
        let spec: PerfEventSpec = "cycles".parse().unwrap();
        assert_eq!(spec.name, "cycles");
        assert_eq!(spec.event_type, EventType::Hardware);
        assert_eq!(spec.sample_period, 10_000_000);
    }

    #[test]
    fn test_parse_overrides_period() {
        let spec: PerfEventSpec = "cache_misses=250".parse().unwrap();
        assert_eq!(spec.sample_period, 250);
        assert_eq!(spec.to_string(), "cache_misses=250");
    }

    #[test]
    fn test_parse_software_event() {
        let spec: PerfEventSpec = "page_faults".parse().unwrap();
        assert_eq!(spec.event_type, EventType::Software);
        assert_eq!(spec.config, perf_sw_ids::PERF_COUNT_SW_PAGE_FAULTS as u64);
    }

    #[test]
    fn test_parse_rejects_unknown_event() {
        let err = "cyclez".parse::<PerfEventSpec>().unwrap_err();
        assert_eq!(err, EventSpecError::UnknownEvent("cyclez".to_string()));
        assert!(err.to_string().contains("instructions"));
    }

    #[test]
    fn test_parse_rejects_bad_period() {
        assert!(matches!(
            "cycles=abc".parse::<PerfEventSpec>(),
            Err(EventSpecError::InvalidPeriod(_))
        ));
        assert!(matches!("cycles=0".parse::<PerfEventSpec>(), Err(EventSpecError::InvalidPeriod(_))));
    }

    #[test]
    fn test_parse_rejects_empty_name() {
        assert_eq!("=5".parse::<PerfEventSpec>(), Err(EventSpecError::MissingName));
    }

    #[test]
    fn test_supported_names_are_unique() {
        let mut names: Vec<_> = SUPPORTED_PERF_EVENTS.iter().map(|e| e.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), SUPPORTED_PERF_EVENTS.len());
    }
}
