//! Error handling for the fortify engine
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Graph-construction errors (`Cycle`, `UnknownDependency`) are fatal and
//! reported before any module executes. Per-module lifecycle failures travel
//! as structured `ModuleError` values inside execution results, not through
//! this enum.

use strum::Display;
use thiserror::Error;

/// The lifecycle phase a module error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum LifecyclePhase {
    /// `validate()`: pre-flight checks, nothing mutated yet
    Validate,
    /// `configure()`: the state-changing phase
    Configure,
    /// `verify()`: post-change re-check of real system state
    Verify,
}

/// Main error type for the fortify engine
#[derive(Error, Debug)]
pub enum FortifyError {
    /// The module dependency graph contains a cycle
    #[error("dependency cycle detected: {}", members.join(" -> "))]
    Cycle {
        /// Names of the modules forming the cycle, in walk order
        members: Vec<String>,
    },

    /// A module declares a dependency on a name not in the enabled set
    #[error("module '{module}' depends on unknown module '{dependency}'")]
    UnknownDependency { module: String, dependency: String },

    /// One or more undo actions failed during rollback.
    /// This leaves the system in an unknown state and is never swallowed.
    #[error("rollback incomplete: {failed} of {total} undo action(s) failed")]
    Rollback { failed: usize, total: usize },

    /// Configuration errors (loading, parsing, validation)
    #[error("configuration error: {0}")]
    Config(String),

    /// IO errors (ledger persistence, file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for fortify engine operations
pub type Result<T> = std::result::Result<T, FortifyError>;

impl FortifyError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_lists_members() {
        let err = FortifyError::Cycle {
            members: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_rollback_error_counts_failures() {
        let err = FortifyError::Rollback { failed: 2, total: 5 };
        assert_eq!(
            err.to_string(),
            "rollback incomplete: 2 of 5 undo action(s) failed"
        );
    }

    #[test]
    fn test_phase_display_is_lowercase() {
        assert_eq!(LifecyclePhase::Validate.to_string(), "validate");
        assert_eq!(LifecyclePhase::Configure.to_string(), "configure");
        assert_eq!(LifecyclePhase::Verify.to_string(), "verify");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "ledger missing");
        let err: FortifyError = io_err.into();
        assert!(matches!(err, FortifyError::Io(_)));
    }
}
