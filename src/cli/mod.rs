//! CLI module for storefront-sync
//!
//! Provides command-line interface for:
//! - check-config: Validate a config file
//! - simulate: Run the engine against an in-memory backend

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{check_config, run, run_command, run_simulation, simulate};
pub use errors::{CliError, CliResult};
