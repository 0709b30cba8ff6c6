//! Rollback ledger: durable, ordered log of undo actions.
//!
//! Modules append a [`RollbackAction`] for every state change they are about
//! to make, and the append is persisted to disk *before* `record()` returns.
//! A crash mid-change therefore always leaves a record of how to undo it:
//! on startup a pre-existing ledger file is loaded back so an interrupted run
//! can still be reversed without re-running any module.
//!
//! Replay is strictly LIFO: the most recent change is undone first, since
//! later changes may depend on earlier ones still being in place. Append
//! order across concurrently-finishing modules reflects real application
//! order, which is exactly the order rollback must respect.

use crate::command::CommandRunner;
use crate::module::unix_millis;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use strum::Display;
use tracing::{error, info, warn};

/// What kind of state change an action reverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionKind {
    /// Run an arbitrary undo command
    Command,
    /// Restore a backed-up file over its target
    FileRestore,
    /// Remove packages that were installed
    PackageRemove,
    /// Stop (and disable) a service that was started
    ServiceStop,
}

/// Immutable undo record. Appended by modules during `configure()`, never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackAction {
    pub kind: ActionKind,
    /// Human-readable description for the run report
    pub description: String,
    /// Kind-specific payload, opaque to the ledger
    pub data: serde_json::Value,
    /// Unix epoch milliseconds at append time
    pub timestamp: u64,
}

impl RollbackAction {
    /// Undo via an arbitrary command.
    pub fn command(description: impl Into<String>, program: &str, args: &[&str]) -> Self {
        Self {
            kind: ActionKind::Command,
            description: description.into(),
            data: serde_json::json!({ "program": program, "args": args }),
            timestamp: unix_millis(),
        }
    }

    /// Undo by restoring `backup` over `target`.
    pub fn file_restore(
        description: impl Into<String>,
        backup: impl AsRef<Path>,
        target: impl AsRef<Path>,
    ) -> Self {
        Self {
            kind: ActionKind::FileRestore,
            description: description.into(),
            data: serde_json::json!({
                "backup": backup.as_ref().to_string_lossy(),
                "target": target.as_ref().to_string_lossy(),
            }),
            timestamp: unix_millis(),
        }
    }

    /// Undo by removing installed packages through the named manager.
    pub fn package_remove(
        description: impl Into<String>,
        manager: &str,
        packages: &[&str],
    ) -> Self {
        Self {
            kind: ActionKind::PackageRemove,
            description: description.into(),
            data: serde_json::json!({ "manager": manager, "packages": packages }),
            timestamp: unix_millis(),
        }
    }

    /// Undo by stopping and disabling a service.
    pub fn service_stop(description: impl Into<String>, service: &str) -> Self {
        Self {
            kind: ActionKind::ServiceStop,
            description: description.into(),
            data: serde_json::json!({ "service": service }),
            timestamp: unix_millis(),
        }
    }
}

/// On-disk schema: `{actions, saved_at}`.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerState {
    actions: Vec<RollbackAction>,
    saved_at: u64,
}

/// Outcome of replaying a single undo action.
#[derive(Debug, Clone, Serialize)]
pub struct UndoOutcome {
    pub description: String,
    pub kind: ActionKind,
    pub success: bool,
    pub error: Option<String>,
}

/// Outcome of a full rollback pass.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub outcomes: Vec<UndoOutcome>,
    pub dry_run: bool,
}

impl RollbackReport {
    /// True if every attempted undo action succeeded.
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success).count()
    }
}

/// Reverses one action. Implementations know how to undo each action kind;
/// the ledger itself only owns ordering and durability.
pub trait UndoExecutor: Send + Sync {
    fn undo(&self, action: &RollbackAction) -> Result<()>;
}

/// Durable rollback ledger. Exclusively owns the in-memory action list and
/// its on-disk mirror; safe to call from multiple worker threads.
pub struct RollbackLedger {
    path: PathBuf,
    actions: Mutex<Vec<RollbackAction>>,
}

impl RollbackLedger {
    /// Open the ledger at `path`, recovering persisted actions from a prior
    /// interrupted run if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let actions = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read rollback ledger {path:?}"))?;
            let state: LedgerState = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse rollback ledger {path:?}"))?;
            if !state.actions.is_empty() {
                warn!(
                    count = state.actions.len(),
                    ?path,
                    "recovered rollback actions from interrupted run"
                );
            }
            state.actions
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            actions: Mutex::new(actions),
        })
    }

    /// Append an action and synchronously persist the whole list before
    /// returning. Intentionally unbuffered: latency is traded for the
    /// guarantee that a crash after `record()` can always be undone.
    pub fn record(&self, action: RollbackAction) -> Result<()> {
        let mut actions = self.actions.lock().expect("ledger mutex poisoned");
        actions.push(action);
        self.persist(&actions)
    }

    /// Snapshot of the recorded actions, oldest first.
    pub fn actions(&self) -> Vec<RollbackAction> {
        self.actions.lock().expect("ledger mutex poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.actions.lock().expect("ledger mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard every recorded action and the durable file.
    ///
    /// Called once a run finishes fully successfully: its changes are
    /// committed, and a leftover file would make the next startup treat them
    /// as an interrupted run and put them in scope of that run's rollback.
    pub fn clear(&self) -> Result<()> {
        let mut actions = self.actions.lock().expect("ledger mutex poisoned");
        actions.clear();
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to clear rollback ledger {:?}", self.path))?;
        }
        Ok(())
    }

    /// Replay all actions in reverse order through `executor`.
    ///
    /// A failed undo is recorded and replay continues with the remaining
    /// actions (partial rollback is strictly better than none), but the
    /// report marks the rollback failed if any action failed. Only a fully
    /// successful non-dry run clears the ledger and its durable copy.
    pub fn rollback(&self, executor: &dyn UndoExecutor, dry_run: bool) -> Result<RollbackReport> {
        let mut actions = self.actions.lock().expect("ledger mutex poisoned");
        let mut outcomes = Vec::with_capacity(actions.len());

        for action in actions.iter().rev() {
            if dry_run {
                info!(kind = %action.kind, "dry-run: would undo: {}", action.description);
                outcomes.push(UndoOutcome {
                    description: action.description.clone(),
                    kind: action.kind,
                    success: true,
                    error: None,
                });
                continue;
            }

            match executor.undo(action) {
                Ok(()) => {
                    info!(kind = %action.kind, "undone: {}", action.description);
                    outcomes.push(UndoOutcome {
                        description: action.description.clone(),
                        kind: action.kind,
                        success: true,
                        error: None,
                    });
                }
                Err(err) => {
                    // A failed undo leaves the system in an unknown state.
                    error!(kind = %action.kind, error = %err, "undo failed: {}", action.description);
                    outcomes.push(UndoOutcome {
                        description: action.description.clone(),
                        kind: action.kind,
                        success: false,
                        error: Some(format!("{err:#}")),
                    });
                }
            }
        }

        let report = RollbackReport { outcomes, dry_run };
        if !dry_run && report.succeeded() {
            actions.clear();
            if self.path.exists() {
                fs::remove_file(&self.path)
                    .with_context(|| format!("failed to clear rollback ledger {:?}", self.path))?;
            }
        }
        Ok(report)
    }

    /// Serialize the full list to a temp file, fsync, then rename over the
    /// real path so the durable copy is never half-written.
    fn persist(&self, actions: &[RollbackAction]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create ledger directory {parent:?}"))?;
            }
        }

        let state = LedgerState {
            actions: actions.to_vec(),
            saved_at: unix_millis(),
        };
        let json =
            serde_json::to_string_pretty(&state).context("failed to serialize rollback ledger")?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create ledger temp file {tmp:?}"))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write ledger temp file {tmp:?}"))?;
        file.sync_all()
            .with_context(|| format!("failed to sync ledger temp file {tmp:?}"))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace rollback ledger {:?}", self.path))?;
        Ok(())
    }
}

/// Command-backed undo executor dispatching by action kind.
pub struct CommandUndoExecutor {
    runner: CommandRunner,
}

impl CommandUndoExecutor {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }

    fn str_field<'a>(action: &'a RollbackAction, field: &str) -> Result<&'a str> {
        action.data.get(field).and_then(|v| v.as_str()).with_context(|| {
            format!(
                "rollback action '{}' is missing field '{field}'",
                action.description
            )
        })
    }
}

impl UndoExecutor for CommandUndoExecutor {
    fn undo(&self, action: &RollbackAction) -> Result<()> {
        match action.kind {
            ActionKind::Command => {
                let program = Self::str_field(action, "program")?;
                let args: Vec<String> = action
                    .data
                    .get("args")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                self.runner
                    .run(program, &arg_refs)?
                    .ensure_success(&action.description)
            }
            ActionKind::FileRestore => {
                let backup = Self::str_field(action, "backup")?;
                let target = Self::str_field(action, "target")?;
                if self.runner.is_dry_run() {
                    info!(backup, target, "dry-run: skipping file restore");
                    return Ok(());
                }
                fs::copy(backup, target)
                    .with_context(|| format!("failed to restore {backup} over {target}"))?;
                Ok(())
            }
            ActionKind::PackageRemove => {
                let manager = Self::str_field(action, "manager")?;
                let packages: Vec<String> = action
                    .data
                    .get("packages")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                if packages.is_empty() {
                    return Ok(());
                }
                let mut args: Vec<&str> = match manager {
                    "pacman" => vec!["-R", "--noconfirm"],
                    _ => vec!["remove", "-y"],
                };
                args.extend(packages.iter().map(String::as_str));
                self.runner
                    .run(manager, &args)?
                    .ensure_success(&action.description)
            }
            ActionKind::ServiceStop => {
                let service = Self::str_field(action, "service")?;
                self.runner
                    .run("systemctl", &["disable", "--now", service])?
                    .ensure_success(&action.description)
            }
        }
    }
}
