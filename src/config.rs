//! Engine configuration: loading, saving, and validation.
//!
//! One JSON file configures both the engine tunables (worker pool size,
//! retry/breaker settings, ledger location, run timeout) and the settings
//! consumed by the built-in provisioning modules. Missing fields fall back
//! to defaults so a minimal config stays minimal.

use crate::resilience::{BreakerConfig, RetryConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Modules to run; unknown names are rejected at plan time
    pub enabled_modules: Vec<String>,
    /// Worker pool size for intra-batch concurrency
    pub max_workers: usize,
    /// Trigger a full rollback when a mandatory module fails
    pub rollback_on_failure: bool,
    /// Overall run deadline; checked between batches, never mid-module
    pub run_timeout_secs: Option<u64>,
    /// Durable rollback ledger location
    pub ledger_path: PathBuf,
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    /// Package manager binary for install/remove operations
    pub package_manager: String,
    pub ssh: SshSettings,
    pub users: Vec<UserSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled_modules: vec![
                "system".to_string(),
                "security".to_string(),
                "users".to_string(),
                "docker".to_string(),
            ],
            max_workers: 4,
            rollback_on_failure: true,
            run_timeout_secs: None,
            ledger_path: PathBuf::from("/var/lib/fortify/rollback.json"),
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            package_manager: "apt-get".to_string(),
            ssh: SshSettings::default(),
            users: Vec::new(),
        }
    }
}

/// Retry tunables (see `resilience`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_retries: s.max_retries,
            base_delay: Duration::from_millis(s.base_delay_ms),
            backoff_factor: s.backoff_factor,
            max_delay: Duration::from_millis(s.max_delay_ms),
        }
    }
}

/// Circuit breaker tunables (see `resilience`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            open_timeout_secs: 60,
        }
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(s: &BreakerSettings) -> Self {
        Self {
            failure_threshold: s.failure_threshold,
            success_threshold: s.success_threshold,
            open_timeout: Duration::from_secs(s.open_timeout_secs),
        }
    }
}

/// SSH hardening settings consumed by the `security` module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub port: u16,
    pub permit_root_login: bool,
    pub password_auth: bool,
    pub config_path: PathBuf,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            port: 22,
            permit_root_login: false,
            password_auth: false,
            config_path: PathBuf::from("/etc/ssh/sshd_config"),
        }
    }
}

/// A user account the `users` module provisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSpec {
    pub name: String,
    pub groups: Vec<String>,
    pub shell: String,
}

impl Default for UserSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            groups: Vec::new(),
            shell: "/bin/bash".to_string(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Save configuration to a JSON file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }

        if self.retry.max_retries == 0 {
            anyhow::bail!("retry.max_retries must be at least 1");
        }
        if self.retry.backoff_factor < 1.0 {
            anyhow::bail!("retry.backoff_factor must be at least 1.0");
        }

        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker.failure_threshold must be at least 1");
        }

        if self.ssh.port == 0 {
            anyhow::bail!("ssh.port must be non-zero");
        }

        if self.package_manager.trim().is_empty() {
            anyhow::bail!("package_manager must be specified");
        }

        for user in &self.users {
            validate_username(&user.name)?;
        }

        Ok(())
    }
}

/// Username rules: 3-32 chars, starts with a letter, lowercase alphanumeric
/// plus underscore.
pub(crate) fn validate_username(name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("username must be specified");
    }
    if name.len() < 3 || name.len() > 32 {
        anyhow::bail!("username '{name}' must be 3-32 characters long");
    }
    if let Some(first) = name.chars().next() {
        if !first.is_ascii_alphabetic() {
            anyhow::bail!("username '{name}' must start with a letter");
        }
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        anyhow::bail!("username '{name}' can only contain lowercase letters, digits, and underscores");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_workers, 4);
        assert!(config.rollback_on_failure);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = EngineConfig::default();
        config.max_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_ssh_port_rejected() {
        let mut config = EngineConfig::default();
        config.ssh.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_username_rejected() {
        let mut config = EngineConfig::default();
        config.users.push(UserSpec {
            name: "1root".to_string(),
            ..UserSpec::default()
        });
        assert!(config.validate().is_err());

        config.users[0].name = "ab".to_string();
        assert!(config.validate().is_err());

        config.users[0].name = "deploy_bot".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fortify.json");

        let mut config = EngineConfig::default();
        config.max_workers = 2;
        config.ssh.port = 2222;
        config.save_to_file(&path).unwrap();

        let loaded = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.max_workers, 2);
        assert_eq!(loaded.ssh.port, 2222);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fortify.json");
        fs::write(&path, r#"{"max_workers": 8}"#).unwrap();

        let loaded = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.max_workers, 8);
        assert_eq!(loaded.ssh.port, 22);
        assert_eq!(loaded.retry.max_retries, 3);
    }

    #[test]
    fn test_retry_settings_convert() {
        let settings = RetrySettings::default();
        let config: RetryConfig = (&settings).into();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay, Duration::from_millis(500));
    }
}
