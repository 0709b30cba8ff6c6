//! Module contract and execution value types
//!
//! A module is a self-contained unit of provisioning work with a fixed
//! three-step lifecycle: `validate()` (pre-flight checks, no mutation),
//! `configure()` (the state-changing phase), `verify()` (re-check real system
//! state, never cached flags). Concrete modules are selected by name through
//! a [`ModuleFactory`], not a class hierarchy.
//!
//! # Contract
//!
//! - Each lifecycle method returns `Ok(true)` on success, `Ok(false)` on a
//!   clean failure, or `Err` on an unexpected one. The coordinator converts
//!   both failure forms into a structured per-phase [`ModuleError`].
//! - During `configure()`, every state change MUST be preceded by a durably
//!   recorded rollback action (the ledger's `record()` blocks until the
//!   action is persisted).

use crate::config::EngineConfig;
use crate::error::LifecyclePhase;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Static metadata describing a module. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Unique module name
    pub name: String,
    /// Names of modules that must complete before this one starts
    pub depends_on: BTreeSet<String>,
    /// Tie-break ordering: lower runs earlier within a batch-eligible set
    pub priority: u32,
    /// Must not run concurrently with any other module
    pub force_sequential: bool,
    /// Failure aborts the whole run (vs. merely being reported)
    pub mandatory: bool,
}

impl ModuleDescriptor {
    /// Create a descriptor with no dependencies, non-mandatory, concurrent-safe.
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            depends_on: BTreeSet::new(),
            priority,
            force_sequential: false,
            mandatory: false,
        }
    }

    /// Declare dependencies on other modules by name.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Mark this module as mandatory: its failure aborts the run.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Mark this module as never eligible to share a batch.
    pub fn force_sequential(mut self) -> Self {
        self.force_sequential = true;
        self
    }
}

/// Capability trait every provisioning module implements.
///
/// Modules accept injected handles to the rollback ledger and resilience
/// guard at construction time (see the factories in `modules/`); the engine
/// only sees this trait.
pub trait Module: Send {
    /// Pre-flight checks. Must not mutate system state.
    fn validate(&mut self) -> anyhow::Result<bool>;

    /// Apply the module's changes. Every state change must be preceded by a
    /// persisted rollback action.
    fn configure(&mut self) -> anyhow::Result<bool>;

    /// Re-check real system state after configure. Must not rely on flags
    /// cached during `configure()`.
    fn verify(&mut self) -> anyhow::Result<bool>;
}

/// Per-module, per-run execution context: the module instance wired with its
/// collaborators, the shared configuration view, and the dry-run flag.
/// Created when the run plan is built, discarded after the run.
pub struct ExecutionContext {
    pub module: Box<dyn Module>,
    pub config: Arc<EngineConfig>,
    pub dry_run: bool,
}

/// Builds a wired module instance for a name. Supplied by the surrounding
/// CLI/DI layer; the engine does not know concrete module types.
pub type ModuleFactory = dyn Fn(&str) -> anyhow::Result<ExecutionContext> + Send + Sync;

/// Structured error captured at the task boundary for one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleError {
    /// Lifecycle phase the error occurred in
    pub phase: LifecyclePhase,
    /// Human-readable failure message
    pub message: String,
    /// Debug/trace string for the underlying error chain
    pub trace: String,
}

impl std::fmt::Display for ModuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} phase: {}", self.phase, self.message)
    }
}

/// Outcome of one module's lifecycle. Immutable, produced by the execution
/// coordinator, consumed by the orchestrator and reporting layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub module_name: String,
    pub success: bool,
    /// Unix epoch milliseconds
    pub started_at: u64,
    /// Unix epoch milliseconds
    pub completed_at: u64,
    pub error: Option<ModuleError>,
}

impl ExecutionResult {
    /// Successful outcome.
    pub fn success(module_name: impl Into<String>, started_at: u64) -> Self {
        Self {
            module_name: module_name.into(),
            success: true,
            started_at,
            completed_at: unix_millis(),
            error: None,
        }
    }

    /// Failed outcome with a structured per-phase error.
    pub fn failure(module_name: impl Into<String>, started_at: u64, error: ModuleError) -> Self {
        Self {
            module_name: module_name.into(),
            success: false,
            started_at,
            completed_at: unix_millis(),
            error: Some(error),
        }
    }
}

/// Current time as unix epoch milliseconds (0 if the clock is before epoch).
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
