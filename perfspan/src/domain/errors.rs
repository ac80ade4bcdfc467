//! Structured error types for perfspan
//!
//! Using thiserror for automatic Display implementation and error chaining.

use std::path::PathBuf;
use thiserror::Error;

use super::types::Pid;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Too many events requested: {requested}, at most {max} supported")]
    TooManyEvents { requested: usize, max: usize },

    #[error("Too many spans requested: {requested}, at most {max} supported")]
    TooManySpans { requested: usize, max: usize },

    #[error("Span name {name:?} is listed twice")]
    DuplicateSpan { name: String },

    #[error("Configuration rejected: {0}")]
    ConfigRejected(String),

    #[error("Failed to load eBPF object {path}: {error}")]
    EbpfLoadFailed { path: PathBuf, error: String },

    #[error("Probe {provider}:{name} not found in {binary}")]
    ProbeNotFound { provider: String, name: String, binary: PathBuf },

    #[error("Probe {provider}:{name} has call sites with more than {max} different argument layouts, {other:?} does not fit")]
    InconsistentProbeArgs { provider: String, name: String, max: usize, other: String },

    #[error("Probe {provider}:{name} takes {actual} arguments, expected {expected}")]
    ProbeArity { provider: String, name: String, expected: usize, actual: usize },

    #[error("Unsupported USDT argument {arg:?}: {reason}")]
    UnsupportedProbeArg { arg: String, reason: String },

    #[error("Failed to attach {probe} to {binary}: {error}")]
    ProbeAttachFailed { probe: String, binary: String, error: String },

    #[error("Malformed .note.stapsdt in {binary}: {reason}")]
    MalformedNote { binary: PathBuf, reason: String },

    #[error("Process {0} not found")]
    ProcessNotFound(Pid),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Object(#[from] object::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write summary file: {0}")]
    WriteFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loader_error_display() {
        let err = LoaderError::ProcessNotFound(Pid(1234));
        assert_eq!(err.to_string(), "Process PID:1234 not found");
    }

    #[test]
    fn test_inconsistent_probe_args_names_extra_layout() {
        let err = LoaderError::InconsistentProbeArgs {
            provider: "perfspan".to_string(),
            name: "enter".to_string(),
            max: 4,
            other: "8@%rbx".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("perfspan:enter"));
        assert!(msg.contains("more than 4"));
        assert!(msg.contains("%rbx"));
    }

    #[test]
    fn test_too_many_events_display() {
        let err = LoaderError::TooManyEvents { requested: 9, max: 8 };
        assert!(err.to_string().contains("at most 8"));
    }
}
