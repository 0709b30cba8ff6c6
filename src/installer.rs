//! Run orchestration: wires the graph, coordinator, guard, and ledger into
//! one install run and reports the outcome.
//!
//! The installer owns the shared collaborator handles for one process
//! lifetime. Circuit breaker state therefore spans the whole run, and the
//! ledger opened here recovers any actions persisted by a previous
//! interrupted run before new work starts.

use crate::command::CommandRunner;
use crate::config::EngineConfig;
use crate::coordinator::{ExecutionCoordinator, ProgressEvent, ProgressKind};
use crate::graph::DependencyGraph;
use crate::ledger::{CommandUndoExecutor, RollbackLedger, RollbackReport};
use crate::locks::ResourceLockRegistry;
use crate::module::ExecutionResult;
use crate::modules::{self, ModuleDeps};
use crate::resilience::ResilienceGuard;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Final status of one module within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleStatus {
    Succeeded,
    Failed,
    /// Planned but never dispatched because the run aborted first
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ModuleOutcome {
    pub name: String,
    pub status: ModuleStatus,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Everything a caller needs to know about a finished run.
#[derive(Debug)]
pub struct RunReport {
    pub outcomes: Vec<ModuleOutcome>,
    pub aborted: bool,
    pub timed_out: bool,
    pub dry_run: bool,
    /// Present when an automatic rollback ran after an aborted run
    pub rollback: Option<RollbackReport>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        !self.aborted && self.outcomes.iter().all(|o| o.status != ModuleStatus::Failed)
    }

    /// Human-readable summary, one line per module.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.dry_run {
            out.push_str("Dry run - no changes were made.\n");
        }
        for outcome in &self.outcomes {
            match outcome.status {
                ModuleStatus::Succeeded => {
                    let _ = writeln!(out, "  ✓ {} ({}ms)", outcome.name, outcome.duration_ms);
                }
                ModuleStatus::Failed => {
                    let detail = outcome.error.as_deref().unwrap_or("unknown error");
                    let _ = writeln!(out, "  ✗ {} - {detail}", outcome.name);
                }
                ModuleStatus::Skipped => {
                    let _ = writeln!(out, "  - {} (skipped)", outcome.name);
                }
            }
        }
        if self.timed_out {
            out.push_str("Run deadline exceeded; remaining modules were skipped.\n");
        }
        if let Some(rollback) = &self.rollback {
            if rollback.succeeded() {
                let _ = writeln!(out, "Rollback completed: {} action(s) undone.", rollback.outcomes.len());
            } else {
                let _ = writeln!(
                    out,
                    "Rollback incomplete: {} of {} undo action(s) failed.",
                    rollback.failed_count(),
                    rollback.outcomes.len()
                );
            }
        }
        out
    }
}

/// Orchestrates one install (or rollback) over a fixed configuration.
pub struct Installer {
    config: Arc<EngineConfig>,
    ledger: Arc<RollbackLedger>,
    guard: Arc<ResilienceGuard>,
    locks: Arc<ResourceLockRegistry>,
    runner: CommandRunner,
}

impl Installer {
    pub fn new(config: EngineConfig, dry_run: bool) -> Result<Self> {
        config.validate()?;
        let ledger = RollbackLedger::open(&config.ledger_path)?;
        let guard = ResilienceGuard::new((&config.breaker).into(), (&config.retry).into());
        Ok(Self {
            config: Arc::new(config),
            ledger: Arc::new(ledger),
            guard: Arc::new(guard),
            locks: Arc::new(ResourceLockRegistry::new()),
            runner: CommandRunner::new(dry_run),
        })
    }

    /// Compute the batch plan without executing anything.
    pub fn plan(&self) -> Result<Vec<Vec<String>>> {
        let descriptors = modules::descriptors(&self.config)?;
        let graph = DependencyGraph::build(&descriptors)?;
        Ok(graph.execution_batches().to_vec())
    }

    /// Execute the full run: plan, dispatch batch by batch, and on an
    /// aborted run trigger an automatic rollback when configured.
    pub fn run(&self) -> Result<RunReport> {
        let descriptors = modules::descriptors(&self.config)?;
        let graph = DependencyGraph::build(&descriptors)?;
        let batches = graph.execution_batches().to_vec();
        info!(
            modules = graph.len(),
            batches = batches.len(),
            dry_run = self.runner.is_dry_run(),
            "starting run"
        );

        let deps = ModuleDeps {
            config: Arc::clone(&self.config),
            ledger: Arc::clone(&self.ledger),
            guard: Arc::clone(&self.guard),
            locks: Arc::clone(&self.locks),
            runner: self.runner,
        };
        let factory = modules::factory(deps);

        let (tx, rx) = mpsc::channel::<ProgressEvent>();
        let drainer = thread::spawn(move || {
            for event in rx {
                match event.kind {
                    ProgressKind::Start => info!(module = %event.module, "module started"),
                    ProgressKind::Progress => {
                        info!(module = %event.module, phase = %event.detail, "module progress")
                    }
                    ProgressKind::Complete => {
                        info!(module = %event.module, outcome = %event.detail, "module finished")
                    }
                }
            }
        });

        let coordinator = ExecutionCoordinator::new(self.config.max_workers);
        let deadline = self
            .config
            .run_timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));

        let mut results: HashMap<String, ExecutionResult> = HashMap::new();
        let mut aborted = false;
        let mut timed_out = false;

        for batch in &batches {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    warn!("run deadline exceeded; skipping remaining batches");
                    aborted = true;
                    timed_out = true;
                    break;
                }
            }
            let outcome =
                coordinator.execute(std::slice::from_ref(batch), graph.descriptors(), &factory, &tx);
            results.extend(outcome.results);
            if outcome.aborted {
                aborted = true;
                break;
            }
        }

        drop(tx);
        let _ = drainer.join();

        let mut rollback = None;
        if aborted && self.config.rollback_on_failure && !self.ledger.is_empty() {
            warn!("run aborted; rolling back recorded actions");
            let executor = CommandUndoExecutor::new(self.runner);
            let report = self
                .ledger
                .rollback(&executor, self.runner.is_dry_run())
                .context("automatic rollback failed")?;
            rollback = Some(report);
        }

        let report = self.build_report(&batches, results, aborted, timed_out, rollback);

        // A fully successful run commits its changes: retire the ledger so
        // the next startup does not treat them as an interrupted run, and so
        // a later run's automatic rollback cannot reach back into this one.
        if report.success() && !self.runner.is_dry_run() {
            self.ledger
                .clear()
                .context("failed to retire rollback ledger after successful run")?;
        }

        Ok(report)
    }

    /// Replay the persisted ledger without running any module.
    pub fn rollback(&self) -> Result<RollbackReport> {
        let executor = CommandUndoExecutor::new(self.runner);
        self.ledger.rollback(&executor, self.runner.is_dry_run())
    }

    fn build_report(
        &self,
        batches: &[Vec<String>],
        results: HashMap<String, ExecutionResult>,
        aborted: bool,
        timed_out: bool,
        rollback: Option<RollbackReport>,
    ) -> RunReport {
        let mut outcomes = Vec::new();
        for name in batches.iter().flatten() {
            let outcome = match results.get(name) {
                Some(result) => ModuleOutcome {
                    name: name.clone(),
                    status: if result.success {
                        ModuleStatus::Succeeded
                    } else {
                        ModuleStatus::Failed
                    },
                    duration_ms: result.completed_at.saturating_sub(result.started_at),
                    error: result.error.as_ref().map(|e| e.to_string()),
                },
                None => ModuleOutcome {
                    name: name.clone(),
                    status: ModuleStatus::Skipped,
                    duration_ms: 0,
                    error: None,
                },
            };
            outcomes.push(outcome);
        }

        RunReport {
            outcomes,
            aborted,
            timed_out,
            dry_run: self.runner.is_dry_run(),
            rollback,
        }
    }
}
