//! Command-line interface for swe-curator.
//!
//! One subcommand per curation stage plus `run` for the whole pipeline.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
