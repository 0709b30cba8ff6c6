//! fortify - command line entry point.

use fortify::cli::{Cli, Commands};
use fortify::config::EngineConfig;
use fortify::error::FortifyError;
use fortify::installer::Installer;
use std::path::Path;
use tracing::{error, info};

/// Initialize tracing with RUST_LOG override support.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from_file(path),
        None => Ok(EngineConfig::default()),
    }
}

fn main() {
    init_tracing();

    let cli = Cli::parse_args();
    if let Err(e) = run(cli) {
        error!("{e:#}");
        eprintln!("✗ {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let dry_run = cli.dry_run;
    // Bare `fortify` runs an install with defaults.
    let command = cli.command.unwrap_or(Commands::Install { config: None });

    match command {
        Commands::Install { config } => {
            let config = load_config(config.as_deref())?;
            info!(dry_run, "starting install");
            let installer = Installer::new(config, dry_run)?;
            let report = installer.run()?;
            print!("{}", report.render());
            if !report.success() {
                anyhow::bail!("install did not complete successfully");
            }
            println!("✓ All modules completed");
            Ok(())
        }
        Commands::Rollback { config } => {
            let config = load_config(config.as_deref())?;
            let installer = Installer::new(config, dry_run)?;
            let report = installer.rollback()?;
            for outcome in &report.outcomes {
                if outcome.success {
                    println!("  ✓ {}", outcome.description);
                } else {
                    let detail = outcome.error.as_deref().unwrap_or("unknown error");
                    println!("  ✗ {} - {detail}", outcome.description);
                }
            }
            if report.succeeded() {
                println!("✓ Rollback complete ({} action(s))", report.outcomes.len());
                Ok(())
            } else {
                Err(FortifyError::Rollback {
                    failed: report.failed_count(),
                    total: report.outcomes.len(),
                }
                .into())
            }
        }
        Commands::Plan { config } => {
            let config = load_config(config.as_deref())?;
            let installer = Installer::new(config, true)?;
            for (index, batch) in installer.plan()?.iter().enumerate() {
                println!("batch {index}: {}", batch.join(", "));
            }
            Ok(())
        }
        Commands::Validate { config } => {
            let loaded = EngineConfig::load_from_file(&config)?;
            loaded.validate()?;
            println!("✓ Configuration file is valid: {config:?}");
            Ok(())
        }
    }
}

