//! CLI argument definitions using clap
//!
//! Commands:
//! - storefront-sync check-config --config <path>
//! - storefront-sync simulate [--config <path>]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// storefront-sync - Realtime sync engine tooling
#[derive(Parser, Debug)]
#[command(name = "storefront-sync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load and validate a config file, printing the effective config
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./storefront-sync.json")]
        config: PathBuf,
    },

    /// Run the sync engine against an in-memory backend and print the outcome
    Simulate {
        /// Path to configuration file (defaults apply when omitted)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
