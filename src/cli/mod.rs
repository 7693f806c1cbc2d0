//! Command-line interface for appforge.
//!
//! Provides commands for bulk and single containerized generation, a local
//! debugging mode, and the hidden in-container task entry point.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
