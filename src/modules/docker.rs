//! Container runtime module ("docker").
//!
//! Installs the docker engine through the configured package manager and
//! enables its service. Both rollback actions (package removal, service
//! stop) are recorded before any mutating command runs; installation goes
//! through the resilience guard and holds the package-manager lock so it
//! never races the system module's index refresh.

use super::{docker_package, install_args, ModuleDeps};
use crate::ledger::RollbackAction;
use crate::locks::PACKAGE_MANAGER;
use crate::module::Module;
use tracing::{debug, info};

pub struct DockerModule {
    deps: ModuleDeps,
}

impl DockerModule {
    pub fn new(deps: ModuleDeps) -> Self {
        Self { deps }
    }

    fn manager(&self) -> &str {
        &self.deps.config.package_manager
    }

    fn docker_present(&self) -> anyhow::Result<bool> {
        Ok(self
            .deps
            .runner
            .probe("sh", &["-c", "command -v docker"])?
            .success)
    }
}

impl Module for DockerModule {
    fn validate(&mut self) -> anyhow::Result<bool> {
        let check = format!("command -v {}", self.manager());
        Ok(self.deps.runner.probe("sh", &["-c", &check])?.success)
    }

    fn configure(&mut self) -> anyhow::Result<bool> {
        if self.deps.runner.is_dry_run() {
            info!("dry-run: would install and enable docker");
            return Ok(true);
        }

        if self.docker_present()? {
            debug!("docker already installed; skipping installation");
        } else {
            let manager = self.deps.config.package_manager.clone();
            let package = docker_package(&manager);

            self.deps.ledger.record(RollbackAction::package_remove(
                format!("remove package {package}"),
                &manager,
                &[package],
            ))?;
            self.deps.ledger.record(RollbackAction::service_stop(
                "stop and disable docker service",
                "docker",
            ))?;

            let args = install_args(&manager, &[package]);
            let runner = self.deps.runner;
            let locks = &self.deps.locks;
            self.deps
                .guard
                .protect("package-repository", || {
                    locks.with_lock(PACKAGE_MANAGER, || {
                        runner.run(&manager, &args)?.ensure_success("docker installation")
                    })
                })
                .map_err(anyhow::Error::from)?;
        }

        self.deps
            .runner
            .run("systemctl", &["enable", "--now", "docker"])?
            .ensure_success("enable docker service")?;

        Ok(true)
    }

    fn verify(&mut self) -> anyhow::Result<bool> {
        if self.deps.runner.is_dry_run() {
            return Ok(true);
        }
        if !self.docker_present()? {
            return Ok(false);
        }
        let active = self
            .deps
            .runner
            .probe("systemctl", &["is-active", "--quiet", "docker"])?;
        Ok(active.success)
    }
}
