//! Command-line interface for perfspan
//!
//! This module contains CLI argument parsing and configuration

pub mod args;

pub use args::Args;
