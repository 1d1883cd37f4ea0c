//! Command-line interface.

pub mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
