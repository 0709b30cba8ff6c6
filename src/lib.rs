//! fortify - module-based machine provisioning and hardening engine.
//!
//! The engine turns a set of module descriptors into an ordered batch plan
//! ([`graph`]), executes each batch on a bounded worker pool
//! ([`coordinator`]), shields flaky external resources behind retry and a
//! circuit breaker ([`resilience`]), and records every state change in a
//! durable rollback ledger ([`ledger`]) so an aborted or crashed run can be
//! reversed. [`installer`] wires it all together for the CLI.

pub mod cli;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod installer;
pub mod ledger;
pub mod locks;
pub mod module;
pub mod modules;
pub mod resilience;

pub use command::{CommandOutput, CommandRunner};
pub use config::EngineConfig;
pub use coordinator::{ExecutionCoordinator, ProgressEvent, ProgressKind};
pub use error::{FortifyError, LifecyclePhase, Result};
pub use graph::DependencyGraph;
pub use installer::{Installer, ModuleStatus, RunReport};
pub use ledger::{ActionKind, RollbackAction, RollbackLedger, UndoExecutor};
pub use module::{ExecutionContext, ExecutionResult, Module, ModuleDescriptor, ModuleFactory};
pub use resilience::{BreakerConfig, CircuitState, ResilienceGuard, RetryConfig};
