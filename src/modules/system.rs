//! System preparation module.
//!
//! Refreshes the package manager's index so later modules install against
//! current metadata. The index refresh goes through the resilience guard
//! (mirrors flake constantly) and holds the package-manager lock for the
//! duration of the mutating call only.

use super::{refresh_args, ModuleDeps};
use crate::locks::PACKAGE_MANAGER;
use crate::module::Module;
use tracing::info;

pub struct SystemModule {
    deps: ModuleDeps,
}

impl SystemModule {
    pub fn new(deps: ModuleDeps) -> Self {
        Self { deps }
    }

    fn manager(&self) -> &str {
        &self.deps.config.package_manager
    }
}

impl Module for SystemModule {
    fn validate(&mut self) -> anyhow::Result<bool> {
        let check = format!("command -v {}", self.manager());
        let output = self.deps.runner.probe("sh", &["-c", &check])?;
        Ok(output.success)
    }

    fn configure(&mut self) -> anyhow::Result<bool> {
        if self.deps.runner.is_dry_run() {
            info!(manager = self.manager(), "dry-run: would refresh package index");
            return Ok(true);
        }

        // Index refresh updates cached metadata only; there is no user-visible
        // state to undo, so no ledger entry is recorded.
        let manager = self.deps.config.package_manager.clone();
        let args = refresh_args(&manager);
        let runner = self.deps.runner;
        let locks = &self.deps.locks;

        self.deps
            .guard
            .protect("package-repository", || {
                locks.with_lock(PACKAGE_MANAGER, || {
                    runner.run(&manager, &args)?.ensure_success("package index refresh")
                })
            })
            .map_err(anyhow::Error::from)?;

        Ok(true)
    }

    fn verify(&mut self) -> anyhow::Result<bool> {
        if self.deps.runner.is_dry_run() {
            return Ok(true);
        }
        // The manager must still resolve and respond after the refresh.
        let check = format!("command -v {}", self.manager());
        let output = self.deps.runner.probe("sh", &["-c", &check])?;
        Ok(output.success)
    }
}
