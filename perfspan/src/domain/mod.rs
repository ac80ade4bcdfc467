//! Domain model for perfspan
//!
//! Newtypes for the identifiers that cross the loader and the event processor,
//! and the structured errors of the loader and exporter.

pub mod errors;
pub mod types;

pub use types::{Cookie, CpuId, NameId, Pid, SpanKey};

pub use errors::{ExportError, LoaderError};
