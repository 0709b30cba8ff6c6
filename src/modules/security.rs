//! SSH hardening module ("security").
//!
//! Rewrites the sshd configuration to the hardened settings from
//! [`SshSettings`]: listen port, root login, password authentication. The
//! original file is backed up and a FileRestore action is recorded in the
//! rollback ledger *before* the rewrite touches disk.

use super::ModuleDeps;
use crate::config::SshSettings;
use crate::ledger::RollbackAction;
use crate::module::Module;
use anyhow::Context;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub struct SecurityModule {
    deps: ModuleDeps,
}

impl SecurityModule {
    pub fn new(deps: ModuleDeps) -> Self {
        Self { deps }
    }

    fn settings(&self) -> &SshSettings {
        &self.deps.config.ssh
    }

    fn backup_path(&self) -> PathBuf {
        self.settings().config_path.with_extension("fortify.bak")
    }
}

/// The directives this module enforces, rendered as `(key, value)` pairs.
fn directives(settings: &SshSettings) -> Vec<(String, String)> {
    let yes_no = |b: bool| if b { "yes" } else { "no" }.to_string();
    vec![
        ("Port".to_string(), settings.port.to_string()),
        ("PermitRootLogin".to_string(), yes_no(settings.permit_root_login)),
        ("PasswordAuthentication".to_string(), yes_no(settings.password_auth)),
    ]
}

/// Rewrite `content` so every directive appears exactly once with the wanted
/// value. Existing lines for a key (including commented-out ones) are
/// replaced in place; missing keys are appended.
fn render_config(content: &str, settings: &SshSettings) -> String {
    let wanted = directives(settings);
    let mut seen = vec![false; wanted.len()];

    let mut lines: Vec<String> = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim_start().trim_start_matches('#').trim_start();
        let key = trimmed.split_whitespace().next().unwrap_or("");
        if let Some(pos) = wanted.iter().position(|(k, _)| k == key) {
            if !seen[pos] {
                lines.push(format!("{} {}", wanted[pos].0, wanted[pos].1));
                seen[pos] = true;
            }
            // Duplicate directives are dropped.
            continue;
        }
        lines.push(line.to_string());
    }

    for (pos, (key, value)) in wanted.iter().enumerate() {
        if !seen[pos] {
            lines.push(format!("{key} {value}"));
        }
    }

    let mut rendered = lines.join("\n");
    rendered.push('\n');
    rendered
}

/// Check that `content` carries every enforced directive with its wanted
/// value.
fn config_is_hardened(content: &str, settings: &SshSettings) -> bool {
    directives(settings).iter().all(|(key, value)| {
        content.lines().any(|line| {
            let mut parts = line.split_whitespace();
            parts.next() == Some(key.as_str()) && parts.next() == Some(value.as_str())
        })
    })
}

impl Module for SecurityModule {
    fn validate(&mut self) -> anyhow::Result<bool> {
        Ok(self.settings().config_path.is_file())
    }

    fn configure(&mut self) -> anyhow::Result<bool> {
        let target = self.settings().config_path.clone();
        if self.deps.runner.is_dry_run() {
            info!(?target, "dry-run: would harden sshd configuration");
            return Ok(true);
        }

        let content = fs::read_to_string(&target)
            .with_context(|| format!("failed to read sshd config {target:?}"))?;

        // Re-running against an already hardened file must not touch the
        // backup: it still holds the pristine pre-hardening content, which
        // is what a rollback has to restore.
        if config_is_hardened(&content, self.settings()) {
            debug!(?target, "sshd config already hardened; nothing to do");
            return Ok(true);
        }

        // Back up and record the restore action before touching the target.
        let backup = self.backup_path();
        fs::copy(&target, &backup)
            .with_context(|| format!("failed to back up sshd config to {backup:?}"))?;
        self.deps.ledger.record(RollbackAction::file_restore(
            format!("restore sshd config {}", target.display()),
            &backup,
            &target,
        ))?;

        let rendered = render_config(&content, self.settings());
        fs::write(&target, rendered)
            .with_context(|| format!("failed to write sshd config {target:?}"))?;

        // Reload is best-effort: verify re-checks the file itself, and hosts
        // without systemd (containers, chroots) still get the hardened file.
        let has_systemctl = self
            .deps
            .runner
            .probe("sh", &["-c", "command -v systemctl"])?
            .success;
        if has_systemctl {
            let reload = self.deps.runner.run("systemctl", &["reload", "sshd"])?;
            if !reload.success {
                warn!(stderr = %reload.stderr.trim(), "sshd reload failed; config change applies on next restart");
            }
        }

        Ok(true)
    }

    fn verify(&mut self) -> anyhow::Result<bool> {
        if self.deps.runner.is_dry_run() {
            return Ok(true);
        }
        // Re-read from disk; never trust flags cached during configure.
        let content = fs::read_to_string(&self.settings().config_path)
            .with_context(|| format!("failed to re-read sshd config {:?}", self.settings().config_path))?;
        Ok(config_is_hardened(&content, self.settings()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ledger::ActionKind;
    use crate::modules::test_support;

    fn settings() -> SshSettings {
        SshSettings {
            port: 2222,
            permit_root_login: false,
            password_auth: false,
            config_path: PathBuf::new(),
        }
    }

    #[test]
    fn test_render_replaces_existing_directives() {
        let content = "Port 22\n#PermitRootLogin yes\nX11Forwarding no\n";
        let rendered = render_config(content, &settings());

        assert!(rendered.contains("Port 2222\n"));
        assert!(rendered.contains("PermitRootLogin no\n"));
        assert!(rendered.contains("PasswordAuthentication no\n"));
        // Unrelated directives survive.
        assert!(rendered.contains("X11Forwarding no\n"));
        // Old value is gone.
        assert!(!rendered.contains("Port 22\n"));
    }

    #[test]
    fn test_render_drops_duplicate_directives() {
        let content = "Port 22\nPort 2200\n";
        let rendered = render_config(content, &settings());
        assert_eq!(rendered.matches("Port ").count(), 1);
    }

    #[test]
    fn test_config_is_hardened_checks_values() {
        let good = "Port 2222\nPermitRootLogin no\nPasswordAuthentication no\n";
        let bad = "Port 22\nPermitRootLogin no\nPasswordAuthentication no\n";
        assert!(config_is_hardened(good, &settings()));
        assert!(!config_is_hardened(bad, &settings()));
    }

    #[test]
    fn test_full_cycle_against_temp_config() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sshd_config");
        fs::write(&target, "Port 22\nPermitRootLogin yes\n").unwrap();

        let mut config = EngineConfig::default();
        config.ssh = SshSettings {
            config_path: target.clone(),
            ..settings()
        };
        let deps = test_support::deps(dir.path(), config, false);
        let ledger = std::sync::Arc::clone(&deps.ledger);

        let mut module = SecurityModule::new(deps);
        assert!(module.validate().unwrap());
        assert!(module.configure().unwrap());
        assert!(module.verify().unwrap());

        // A FileRestore action was recorded before the rewrite.
        let actions = ledger.actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::FileRestore);

        // The backup preserves the original content.
        let backup = dir.path().join("sshd_config.fortify.bak");
        assert_eq!(
            fs::read_to_string(backup).unwrap(),
            "Port 22\nPermitRootLogin yes\n"
        );
    }

    #[test]
    fn test_second_run_preserves_pristine_backup() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sshd_config");
        fs::write(&target, "Port 22\nPermitRootLogin yes\n").unwrap();

        let mut config = EngineConfig::default();
        config.ssh = SshSettings {
            config_path: target.clone(),
            ..settings()
        };

        let mut first = SecurityModule::new(test_support::deps(dir.path(), config.clone(), false));
        assert!(first.configure().unwrap());

        // Second run over the already hardened file: the backup must still
        // hold the pre-hardening content and no new undo action is recorded.
        let deps = test_support::deps(dir.path(), config, false);
        let ledger = std::sync::Arc::clone(&deps.ledger);
        let mut second = SecurityModule::new(deps);
        assert!(second.configure().unwrap());
        assert!(second.verify().unwrap());

        let backup = dir.path().join("sshd_config.fortify.bak");
        assert_eq!(
            fs::read_to_string(backup).unwrap(),
            "Port 22\nPermitRootLogin yes\n"
        );
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_validate_fails_when_config_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.ssh.config_path = dir.path().join("missing");

        let mut module = SecurityModule::new(test_support::deps(dir.path(), config, false));
        assert!(!module.validate().unwrap());
    }

    #[test]
    fn test_dry_run_leaves_file_and_ledger_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sshd_config");
        fs::write(&target, "Port 22\n").unwrap();

        let mut config = EngineConfig::default();
        config.ssh.config_path = target.clone();
        let deps = test_support::deps(dir.path(), config, true);
        let ledger = std::sync::Arc::clone(&deps.ledger);

        let mut module = SecurityModule::new(deps);
        assert!(module.configure().unwrap());
        assert!(module.verify().unwrap());
        assert_eq!(fs::read_to_string(&target).unwrap(), "Port 22\n");
        assert!(ledger.is_empty());
    }
}
