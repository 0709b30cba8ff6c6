//! Built-in provisioning modules.
//!
//! Each module is a thin, idempotent unit following the engine's
//! validate → configure → verify contract. Modules receive their
//! collaborators (rollback ledger, resilience guard, resource locks, command
//! runner, shared config) at construction time through [`ModuleDeps`]; the
//! engine itself never sees concrete module types, only the registry's
//! descriptors and factory.

pub mod docker;
pub mod security;
pub mod system;
pub mod users;

use crate::command::CommandRunner;
use crate::config::EngineConfig;
use crate::ledger::RollbackLedger;
use crate::locks::ResourceLockRegistry;
use crate::module::{ExecutionContext, ModuleDescriptor};
use crate::resilience::ResilienceGuard;
use std::sync::Arc;

/// Collaborator handles injected into every built-in module.
#[derive(Clone)]
pub struct ModuleDeps {
    pub config: Arc<EngineConfig>,
    pub ledger: Arc<RollbackLedger>,
    pub guard: Arc<ResilienceGuard>,
    pub locks: Arc<ResourceLockRegistry>,
    pub runner: CommandRunner,
}

/// Descriptors for all built-in modules, filtered to the enabled set.
/// An enabled name with no built-in module behind it is rejected here,
/// before any plan is computed.
pub fn descriptors(config: &EngineConfig) -> anyhow::Result<Vec<ModuleDescriptor>> {
    let all = vec![
        ModuleDescriptor::new("system", 10).mandatory(),
        ModuleDescriptor::new("security", 20)
            .depends_on(["system"])
            .mandatory(),
        ModuleDescriptor::new("users", 30).depends_on(["system"]),
        ModuleDescriptor::new("docker", 40).depends_on(["system", "security"]),
    ];

    for name in &config.enabled_modules {
        if !all.iter().any(|d| &d.name == name) {
            anyhow::bail!("no built-in module named '{name}'");
        }
    }

    Ok(all
        .into_iter()
        .filter(|d| config.enabled_modules.iter().any(|n| n == &d.name))
        .collect())
}

/// Build the module factory over a set of collaborator handles.
pub fn factory(deps: ModuleDeps) -> impl Fn(&str) -> anyhow::Result<ExecutionContext> + Send + Sync {
    move |name: &str| {
        let module: Box<dyn crate::module::Module> = match name {
            "system" => Box::new(system::SystemModule::new(deps.clone())),
            "security" => Box::new(security::SecurityModule::new(deps.clone())),
            "users" => Box::new(users::UsersModule::new(deps.clone())),
            "docker" => Box::new(docker::DockerModule::new(deps.clone())),
            other => anyhow::bail!("no built-in module named '{other}'"),
        };
        Ok(ExecutionContext {
            module,
            config: Arc::clone(&deps.config),
            dry_run: deps.runner.is_dry_run(),
        })
    }
}

/// Arguments to refresh the package index for a given manager.
pub(crate) fn refresh_args(manager: &str) -> Vec<&'static str> {
    match manager {
        "pacman" => vec!["-Sy", "--noconfirm"],
        _ => vec!["update"],
    }
}

/// Arguments to install packages through a given manager.
pub(crate) fn install_args<'a>(manager: &str, packages: &[&'a str]) -> Vec<&'a str> {
    let mut args: Vec<&str> = match manager {
        "pacman" => vec!["-S", "--noconfirm", "--needed"],
        _ => vec!["install", "-y"],
    };
    args.extend_from_slice(packages);
    args
}

/// The package providing the Docker engine under a given manager.
pub(crate) fn docker_package(manager: &str) -> &'static str {
    match manager {
        "pacman" => "docker",
        _ => "docker.io",
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::resilience::{BreakerConfig, RetryConfig};
    use std::time::Duration;

    /// Deps wired against a temp ledger with fast retry settings.
    pub(crate) fn deps(dir: &std::path::Path, config: EngineConfig, dry_run: bool) -> ModuleDeps {
        ModuleDeps {
            config: Arc::new(config),
            ledger: Arc::new(RollbackLedger::open(dir.join("rollback.json")).unwrap()),
            guard: Arc::new(ResilienceGuard::new(
                BreakerConfig::default(),
                RetryConfig {
                    max_retries: 1,
                    base_delay: Duration::from_millis(1),
                    backoff_factor: 2.0,
                    max_delay: Duration::from_millis(2),
                },
            )),
            locks: Arc::new(ResourceLockRegistry::new()),
            runner: CommandRunner::new(dry_run),
        }
    }
}
