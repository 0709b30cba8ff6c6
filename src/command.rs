//! Sanctioned command execution for provisioning modules.
//!
//! This module provides the ONLY way modules shell out to the system. All
//! external commands go through [`CommandRunner::run`] so that:
//!
//! - every invocation is logged with its full argument list
//! - stdout/stderr/exit code are captured, never inherited
//! - dry-run mode short-circuits mutating commands uniformly

use anyhow::{Context, Result};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Output from a completed command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the command exited successfully (exit code 0).
    pub success: bool,
}

impl CommandOutput {
    /// Check that the command succeeded and return an error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            anyhow::bail!(
                "{} failed (exit code {}): {}",
                context,
                code,
                self.stderr.trim()
            )
        }
    }

    fn dry_run() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }
}

/// Executes external commands with captured output.
#[derive(Debug, Clone, Copy)]
pub struct CommandRunner {
    dry_run: bool,
}

impl CommandRunner {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    /// True when mutating commands are skipped and only logged.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Run a command that changes system state.
    ///
    /// In dry-run mode the command is logged and reported as successful
    /// without executing.
    pub fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        if self.dry_run {
            info!(program, ?args, "dry-run: skipping command");
            return Ok(CommandOutput::dry_run());
        }
        self.execute(program, args)
    }

    /// Run a read-only command. Executes even in dry-run mode so previews
    /// reflect the real system.
    pub fn probe(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.execute(program, args)
    }

    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!(program, ?args, "executing command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("failed to spawn command: {program}"))?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            success: output.status.success(),
        };

        if result.success {
            debug!(program, "command succeeded");
        } else {
            info!(
                program,
                code = result.exit_code.unwrap_or(-1),
                "command failed"
            );
        }
        Ok(result)
    }
}
