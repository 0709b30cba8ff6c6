use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// fortify - module-based machine provisioning and hardening
#[derive(Parser)]
#[command(name = "fortify")]
#[command(about = "Dependency-ordered machine provisioning with durable rollback")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Destructive operations (package installs, file rewrites, user
    /// creation) are skipped and logged. Read-only probes still execute so
    /// the preview is realistic. Nothing is recorded in the rollback ledger.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the enabled modules in dependency order
    Install {
        /// Path to configuration file (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Replay the persisted rollback ledger, most recent action first
    Rollback {
        /// Path to configuration file (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the batch plan without executing anything
    Plan {
        /// Path to configuration file (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
