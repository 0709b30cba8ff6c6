//! Service account provisioning module ("users").
//!
//! Creates the accounts listed in [`EngineConfig::users`]. Creation is
//! idempotent: an account that already exists is left alone and gets no
//! rollback entry, so replaying the ledger never deletes a pre-existing
//! user.

use super::ModuleDeps;
use crate::config::{validate_username, UserSpec};
use crate::ledger::RollbackAction;
use crate::module::Module;
use tracing::{debug, info};

pub struct UsersModule {
    deps: ModuleDeps,
}

impl UsersModule {
    pub fn new(deps: ModuleDeps) -> Self {
        Self { deps }
    }

    fn user_exists(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.deps.runner.probe("id", &[name])?.success)
    }

    fn create_user(&self, user: &UserSpec) -> anyhow::Result<()> {
        // Record the undo before useradd runs. If the process dies between
        // record and useradd, replaying a userdel for a user that was never
        // created fails harmlessly and the rest of the ledger still applies.
        self.deps.ledger.record(RollbackAction::command(
            format!("remove user {}", user.name),
            "userdel",
            &["-r", &user.name],
        ))?;

        let groups = user.groups.join(",");
        let mut args: Vec<&str> = vec!["-m", "-s", &user.shell];
        if !groups.is_empty() {
            args.extend(["-G", groups.as_str()]);
        }
        args.push(&user.name);

        self.deps
            .runner
            .run("useradd", &args)?
            .ensure_success(&format!("create user {}", user.name))
    }
}

impl Module for UsersModule {
    fn validate(&mut self) -> anyhow::Result<bool> {
        for user in &self.deps.config.users {
            validate_username(&user.name)?;
        }
        if self.deps.config.users.is_empty() {
            debug!("no users configured; nothing to provision");
            return Ok(true);
        }
        Ok(self
            .deps
            .runner
            .probe("sh", &["-c", "command -v useradd"])?
            .success)
    }

    fn configure(&mut self) -> anyhow::Result<bool> {
        if self.deps.runner.is_dry_run() {
            for user in &self.deps.config.users {
                info!(user = %user.name, "dry-run: would create user");
            }
            return Ok(true);
        }

        let users = self.deps.config.users.clone();
        for user in &users {
            if self.user_exists(&user.name)? {
                debug!(user = %user.name, "user already exists; skipping");
                continue;
            }
            self.create_user(user)?;
        }
        Ok(true)
    }

    fn verify(&mut self) -> anyhow::Result<bool> {
        if self.deps.runner.is_dry_run() {
            return Ok(true);
        }
        for user in &self.deps.config.users {
            if !self.user_exists(&user.name)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
