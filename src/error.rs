//! Custom error types for the automation runtime.
//!
//! This module defines the primary error type, `AutomationError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different failures that can surface from the state-machine engine, the registry,
//! the scheduling worker and the external collaborators.
//!
//! ## Error Hierarchy
//!
//! - **Transitions**: `TransitionNotAllowed`, `UnknownState` and `UndeclaredTransition`
//!   report requests that do not match a machine's declared transition table. They are
//!   recovered locally: the machine state is never mutated when one of these is returned.
//! - **Registry**: `DuplicateMachine`, `MachineNotFound`.
//! - **Attributes and tags**: `InvalidAttribute`, `TagNotFound`, `UnitMismatch`.
//! - **Configuration**: `Config` wraps `figment` extraction errors, `Configuration`
//!   represents semantic validation failures.
//! - **Worker lifecycle**: `WorkerSpawn`, `WorkerNotRunning`, `MachineNotScheduled`,
//!   `WorkerStopped`.
//! - **Collaborators**: `ValueStore` for failures reported by the current-value store.
//!
//! Nothing in this crate treats these errors as fatal: every caller degrades to
//! "this tick, this tag or this transition did nothing" plus a log record.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, AutomationError>;

/// Every failure surfaced by this crate.
#[derive(Error, Debug)]
pub enum AutomationError {
    /// Target state exists but no declared transition leads there
    #[error("Transition from '{from}' to '{to}' is not allowed for machine '{machine}'")]
    TransitionNotAllowed {
        /// Machine name
        machine: String,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// State name not declared by the machine kind
    #[error("Unknown state '{0}'")]
    UnknownState(String),

    /// Guard attached to a transition the machine kind does not declare
    #[error("Transition '{from}_to_{to}' is not declared")]
    UndeclaredTransition {
        /// Source state
        from: String,
        /// Target state
        to: String,
    },

    /// Registry name already taken
    #[error("Machine '{0}' is already registered")]
    DuplicateMachine(String),

    /// No machine registered under that name
    #[error("Machine '{0}' not found")]
    MachineNotFound(String),

    /// Attribute value out of range or not applicable
    #[error("Invalid attribute: {0}")]
    InvalidAttribute(String),

    /// Tag unknown to the value store
    #[error("Tag '{0}' not found")]
    TagNotFound(String),

    /// Units measure different quantities
    #[error("Cannot convert from '{from}' to '{to}'")]
    UnitMismatch {
        /// Source unit symbol
        from: String,
        /// Target unit symbol
        to: String,
    },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed validation
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Worker thread or runtime could not be created
    #[error("Failed to spawn scheduling worker: {0}")]
    WorkerSpawn(String),

    /// No worker is running
    #[error("Scheduling worker is not running")]
    WorkerNotRunning,

    /// Machine is not part of the running schedule
    #[error("Machine '{0}' is not part of the running schedule")]
    MachineNotScheduled(String),

    /// Worker stopped before the machine ran once
    #[error("Scheduling worker stopped before '{0}' was scheduled")]
    WorkerStopped(String),

    /// Failure reported by the value store
    #[error("Value store error: {0}")]
    ValueStore(String),
}

impl AutomationError {
    /// Whether the failure only affected the current request.
    ///
    /// Recoverable errors leave every machine, buffer and schedule untouched.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            AutomationError::Config(_)
                | AutomationError::Io(_)
                | AutomationError::WorkerSpawn(_)
        )
    }
}
