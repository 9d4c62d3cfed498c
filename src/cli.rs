//! Command-line interface for Interceptor
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Interceptor - host intrusion prevention daemon
#[derive(Parser)]
#[command(name = "interceptor")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "global.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the daemon (requires root)
    Run,

    /// Show active jails and recent offense counts
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove the managed firewall chain and clear the jail table
    Reset,

    /// Validate configuration and module descriptors
    Check,

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "interceptor", &mut std::io::stdout());
    }
}
