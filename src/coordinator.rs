//! Execution coordinator: drives batches through a bounded worker pool.
//!
//! Batches run strictly in sequence; concurrency exists only *within* a
//! batch, where up to `max_workers` OS threads each pull module names from a
//! shared queue. Every module is driven through validate → configure →
//! verify as opaque blocking calls. Failures (including panics) are caught
//! at the task boundary, converted into a structured per-phase error inside
//! that module's [`ExecutionResult`], and never crash sibling tasks.
//!
//! Progress is reported as typed events over an mpsc channel so the
//! presentation layer can render live status without polling execution
//! threads.

use crate::error::LifecyclePhase;
use crate::module::{unix_millis, ExecutionResult, Module, ModuleDescriptor, ModuleError, ModuleFactory};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::mpsc::Sender;
use std::sync::Mutex;
use std::thread;
use tracing::{debug, info, warn};

/// Typed progress event for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressKind {
    Start,
    Progress,
    Complete,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub module: String,
    pub detail: String,
}

/// Aggregated outcome of a coordinator pass.
#[derive(Debug)]
pub struct CoordinatorOutcome {
    pub results: HashMap<String, ExecutionResult>,
    /// True if a mandatory module failed and later batches were skipped
    pub aborted: bool,
}

/// Fans batch work across a bounded worker pool.
pub struct ExecutionCoordinator {
    max_workers: usize,
}

impl ExecutionCoordinator {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }

    /// Execute batches in order, waiting for each batch to finish before
    /// dispatching the next. Returns early (with `aborted = true`) when a
    /// mandatory module fails; non-mandatory failures are recorded and the
    /// run continues.
    pub fn execute(
        &self,
        batches: &[Vec<String>],
        descriptors: &BTreeMap<String, ModuleDescriptor>,
        factory: &ModuleFactory,
        progress: &Sender<ProgressEvent>,
    ) -> CoordinatorOutcome {
        let mut results: HashMap<String, ExecutionResult> = HashMap::new();

        for (index, batch) in batches.iter().enumerate() {
            debug!(batch = index, modules = ?batch, "dispatching batch");
            let batch_results = self.run_batch(batch, factory, progress);

            let mut mandatory_failed = false;
            for result in batch_results {
                if !result.success {
                    let mandatory = descriptors
                        .get(&result.module_name)
                        .map(|d| d.mandatory)
                        .unwrap_or(false);
                    if mandatory {
                        warn!(module = %result.module_name, "mandatory module failed, aborting run");
                        mandatory_failed = true;
                    }
                }
                results.insert(result.module_name.clone(), result);
            }

            if mandatory_failed {
                return CoordinatorOutcome {
                    results,
                    aborted: true,
                };
            }
        }

        CoordinatorOutcome {
            results,
            aborted: false,
        }
    }

    /// Run one batch to completion on the worker pool.
    fn run_batch(
        &self,
        batch: &[String],
        factory: &ModuleFactory,
        progress: &Sender<ProgressEvent>,
    ) -> Vec<ExecutionResult> {
        let workers = self.max_workers.min(batch.len()).max(1);
        let queue: Mutex<Vec<String>> = Mutex::new(batch.iter().rev().cloned().collect());
        let (tx, rx) = std::sync::mpsc::channel::<ExecutionResult>();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let progress = progress.clone();
                let queue = &queue;
                scope.spawn(move || loop {
                    let name = queue.lock().expect("batch queue poisoned").pop();
                    let Some(name) = name else { break };
                    let result = run_module(&name, factory, &progress);
                    // Receiver outlives the scope; a send failure means the
                    // coordinator itself is gone.
                    let _ = tx.send(result);
                });
            }
        });
        drop(tx);

        rx.iter().collect()
    }
}

/// Drive one module through its full lifecycle, catching all failures at
/// this boundary.
fn run_module(
    name: &str,
    factory: &ModuleFactory,
    progress: &Sender<ProgressEvent>,
) -> ExecutionResult {
    let started_at = unix_millis();
    emit(progress, ProgressKind::Start, name, "starting");

    let mut ctx = match factory(name) {
        Ok(ctx) => ctx,
        Err(err) => {
            // Nothing was constructed, so nothing can have mutated state.
            let error = ModuleError {
                phase: LifecyclePhase::Validate,
                message: format!("failed to construct module: {err:#}"),
                trace: format!("{err:?}"),
            };
            emit(progress, ProgressKind::Complete, name, "failed");
            return ExecutionResult::failure(name, started_at, error);
        }
    };

    for phase in [
        LifecyclePhase::Validate,
        LifecyclePhase::Configure,
        LifecyclePhase::Verify,
    ] {
        emit(progress, ProgressKind::Progress, name, &phase.to_string());
        if let Err(error) = call_phase(ctx.module.as_mut(), phase) {
            warn!(module = name, phase = %phase, error = %error.message, "module failed");
            emit(progress, ProgressKind::Complete, name, "failed");
            return ExecutionResult::failure(name, started_at, error);
        }
    }

    info!(module = name, "module completed");
    emit(progress, ProgressKind::Complete, name, "ok");
    ExecutionResult::success(name, started_at)
}

/// Invoke one lifecycle method, mapping `Ok(false)`, `Err`, and panics into
/// a structured error carrying the phase.
fn call_phase(module: &mut dyn Module, phase: LifecyclePhase) -> Result<(), ModuleError> {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| match phase {
        LifecyclePhase::Validate => module.validate(),
        LifecyclePhase::Configure => module.configure(),
        LifecyclePhase::Verify => module.verify(),
    }));

    match outcome {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => Err(ModuleError {
            phase,
            message: format!("{phase} returned false"),
            trace: String::new(),
        }),
        Ok(Err(err)) => Err(ModuleError {
            phase,
            message: format!("{err:#}"),
            trace: format!("{err:?}"),
        }),
        Err(panic) => Err(ModuleError {
            phase,
            message: format!("panicked: {}", panic_message(&panic)),
            trace: String::new(),
        }),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn emit(progress: &Sender<ProgressEvent>, kind: ProgressKind, module: &str, detail: &str) {
    // Presentation layer may have hung up; execution never depends on it.
    let _ = progress.send(ProgressEvent {
        kind,
        module: module.to_string(),
        detail: detail.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::module::ExecutionContext;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;

    /// Scripted test module: each phase runs a closure.
    struct ScriptedModule {
        validate: Box<dyn FnMut() -> anyhow::Result<bool> + Send>,
        configure: Box<dyn FnMut() -> anyhow::Result<bool> + Send>,
        verify: Box<dyn FnMut() -> anyhow::Result<bool> + Send>,
    }

    impl ScriptedModule {
        fn ok() -> Self {
            Self {
                validate: Box::new(|| Ok(true)),
                configure: Box::new(|| Ok(true)),
                verify: Box::new(|| Ok(true)),
            }
        }
    }

    impl Module for ScriptedModule {
        fn validate(&mut self) -> anyhow::Result<bool> {
            (self.validate)()
        }
        fn configure(&mut self) -> anyhow::Result<bool> {
            (self.configure)()
        }
        fn verify(&mut self) -> anyhow::Result<bool> {
            (self.verify)()
        }
    }

    fn ctx(module: ScriptedModule) -> ExecutionContext {
        ExecutionContext {
            module: Box::new(module),
            config: Arc::new(EngineConfig::default()),
            dry_run: false,
        }
    }

    fn descriptors(batch: &[(&str, bool)]) -> BTreeMap<String, ModuleDescriptor> {
        batch
            .iter()
            .map(|(name, mandatory)| {
                let mut d = ModuleDescriptor::new(*name, 10);
                if *mandatory {
                    d = d.mandatory();
                }
                (name.to_string(), d)
            })
            .collect()
    }

    #[test]
    fn test_independent_modules_both_complete() {
        let coordinator = ExecutionCoordinator::new(2);
        let (tx, _rx) = channel();
        let factory = |_name: &str| -> anyhow::Result<ExecutionContext> { Ok(ctx(ScriptedModule::ok())) };

        let outcome = coordinator.execute(
            &[vec!["a".to_string(), "b".to_string()]],
            &descriptors(&[("a", false), ("b", false)]),
            &factory,
            &tx,
        );

        assert!(!outcome.aborted);
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results["a"].success);
        assert!(outcome.results["b"].success);
    }

    #[test]
    fn test_failed_validate_skips_configure() {
        let configured = Arc::new(AtomicU32::new(0));
        let configured_clone = Arc::clone(&configured);

        let coordinator = ExecutionCoordinator::new(1);
        let (tx, _rx) = channel();
        let factory = move |_name: &str| -> anyhow::Result<ExecutionContext> {
            let configured = Arc::clone(&configured_clone);
            Ok(ctx(ScriptedModule {
                validate: Box::new(|| Ok(false)),
                configure: Box::new(move || {
                    configured.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }),
                verify: Box::new(|| Ok(true)),
            }))
        };

        let outcome = coordinator.execute(
            &[vec!["x".to_string()]],
            &descriptors(&[("x", false)]),
            &factory,
            &tx,
        );

        let result = &outcome.results["x"];
        assert!(!result.success);
        assert_eq!(
            result.error.as_ref().map(|e| e.phase),
            Some(LifecyclePhase::Validate)
        );
        assert_eq!(configured.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_configure_error_is_captured_with_phase() {
        let coordinator = ExecutionCoordinator::new(1);
        let (tx, _rx) = channel();
        let factory = |_name: &str| -> anyhow::Result<ExecutionContext> {
            Ok(ctx(ScriptedModule {
                validate: Box::new(|| Ok(true)),
                configure: Box::new(|| Err(anyhow::anyhow!("apt-get exited 100"))),
                verify: Box::new(|| Ok(true)),
            }))
        };

        let outcome = coordinator.execute(
            &[vec!["x".to_string()]],
            &descriptors(&[("x", false)]),
            &factory,
            &tx,
        );

        let err = outcome.results["x"].error.as_ref().unwrap();
        assert_eq!(err.phase, LifecyclePhase::Configure);
        assert!(err.message.contains("apt-get exited 100"));
    }

    #[test]
    fn test_panicking_module_does_not_crash_siblings() {
        let coordinator = ExecutionCoordinator::new(2);
        let (tx, _rx) = channel();
        let factory = |name: &str| -> anyhow::Result<ExecutionContext> {
            if name == "bad" {
                Ok(ctx(ScriptedModule {
                    validate: Box::new(|| Ok(true)),
                    configure: Box::new(|| panic!("boom")),
                    verify: Box::new(|| Ok(true)),
                }))
            } else {
                Ok(ctx(ScriptedModule::ok()))
            }
        };

        let outcome = coordinator.execute(
            &[vec!["bad".to_string(), "good".to_string()]],
            &descriptors(&[("bad", false), ("good", false)]),
            &factory,
            &tx,
        );

        assert!(outcome.results["good"].success);
        let err = outcome.results["bad"].error.as_ref().unwrap();
        assert_eq!(err.phase, LifecyclePhase::Configure);
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn test_mandatory_failure_skips_later_batches() {
        let coordinator = ExecutionCoordinator::new(2);
        let (tx, _rx) = channel();
        let factory = |name: &str| -> anyhow::Result<ExecutionContext> {
            if name == "core" {
                Ok(ctx(ScriptedModule {
                    validate: Box::new(|| Ok(true)),
                    configure: Box::new(|| Ok(false)),
                    verify: Box::new(|| Ok(true)),
                }))
            } else {
                Ok(ctx(ScriptedModule::ok()))
            }
        };

        let batches = vec![
            vec!["first".to_string()],
            vec!["core".to_string()],
            vec!["third".to_string()],
            vec!["fourth".to_string()],
        ];
        let outcome = coordinator.execute(
            &batches,
            &descriptors(&[("first", false), ("core", true), ("third", false), ("fourth", false)]),
            &factory,
            &tx,
        );

        assert!(outcome.aborted);
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results.contains_key("first"));
        assert!(outcome.results.contains_key("core"));
        assert!(!outcome.results.contains_key("third"));
        assert!(!outcome.results.contains_key("fourth"));
    }

    #[test]
    fn test_non_mandatory_failure_continues() {
        let coordinator = ExecutionCoordinator::new(1);
        let (tx, _rx) = channel();
        let factory = |name: &str| -> anyhow::Result<ExecutionContext> {
            if name == "optional" {
                Ok(ctx(ScriptedModule {
                    validate: Box::new(|| Ok(true)),
                    configure: Box::new(|| Err(anyhow::anyhow!("nope"))),
                    verify: Box::new(|| Ok(true)),
                }))
            } else {
                Ok(ctx(ScriptedModule::ok()))
            }
        };

        let batches = vec![vec!["optional".to_string()], vec!["next".to_string()]];
        let outcome = coordinator.execute(
            &batches,
            &descriptors(&[("optional", false), ("next", false)]),
            &factory,
            &tx,
        );

        assert!(!outcome.aborted);
        assert!(!outcome.results["optional"].success);
        assert!(outcome.results["next"].success);
    }

    #[test]
    fn test_progress_events_cover_lifecycle() {
        let coordinator = ExecutionCoordinator::new(1);
        let (tx, rx) = channel();
        let factory = |_name: &str| -> anyhow::Result<ExecutionContext> { Ok(ctx(ScriptedModule::ok())) };

        coordinator.execute(
            &[vec!["m".to_string()]],
            &descriptors(&[("m", false)]),
            &factory,
            &tx,
        );
        drop(tx);

        let events: Vec<ProgressEvent> = rx.iter().collect();
        let kinds: Vec<&ProgressKind> = events.iter().map(|e| &e.kind).collect();
        assert_eq!(kinds.first(), Some(&&ProgressKind::Start));
        assert_eq!(kinds.last(), Some(&&ProgressKind::Complete));
        let details: Vec<&str> = events.iter().map(|e| e.detail.as_str()).collect();
        assert!(details.contains(&"validate"));
        assert!(details.contains(&"configure"));
        assert!(details.contains(&"verify"));
        assert!(details.contains(&"ok"));
    }

    #[test]
    fn test_factory_failure_is_validation_phase() {
        let coordinator = ExecutionCoordinator::new(1);
        let (tx, _rx) = channel();
        let factory = |_name: &str| -> anyhow::Result<ExecutionContext> { anyhow::bail!("unknown module") };

        let outcome = coordinator.execute(
            &[vec!["ghost".to_string()]],
            &descriptors(&[("ghost", false)]),
            &factory,
            &tx,
        );

        let err = outcome.results["ghost"].error.as_ref().unwrap();
        assert_eq!(err.phase, LifecyclePhase::Validate);
        assert!(err.message.contains("unknown module"));
    }
}
