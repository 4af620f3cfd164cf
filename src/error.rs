//! Custom error types for the scan engine.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures a scan can run into, from bad axis parameters to
//! hardware that never reports back.
//!
//! ## Error Hierarchy
//!
//! `DaqError` is an enum that consolidates the failure sources of a scan. Every variant
//! maps onto one machine-distinguishable [`ErrorCategory`]:
//!
//! - **Configuration**: bad axis parameters, oversized scans, figment load failures and
//!   modules that never reported an initialized state. Always raised before the first
//!   step moves anything.
//! - **Assignment**: the actuator/detector binding does not match the configured order.
//! - **Timeout**: a wait phase exhausted its budget. Kept distinct from every other
//!   failure so that a presentation layer can react to it specifically.
//! - **Persistence**: allocation or write failures in the scan container, including the
//!   I/O and serialization errors bubbling up from it.
//! - **Hardware**: a collaborator rejected a command outright.
//!
//! None of them is retried. A failure aborts the scan and leaves already committed data
//! untouched.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Machine-readable classification of a [`DaqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid parameters or modules, detected before the scan starts.
    Configuration,
    /// Actuator/detector binding mismatch.
    Assignment,
    /// No completion within the wait budget.
    Timeout,
    /// Storage allocation or write failure.
    Persistence,
    /// A hardware collaborator failed to accept a command.
    Hardware,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Configuration => "ConfigurationError",
            ErrorCategory::Assignment => "AssignmentError",
            ErrorCategory::Timeout => "TimeoutError",
            ErrorCategory::Persistence => "PersistenceError",
            ErrorCategory::Hardware => "HardwareError",
        };
        f.write_str(name)
    }
}

/// Primary error type of the crate.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Semantic configuration problem (bad values that parsed fine).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The configuration sources could not be loaded or deserialized.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    /// The estimated number of steps is above the configured ceiling.
    #[error("Scan too large: {steps} steps exceed the limit of {limit}")]
    ScanTooLarge {
        /// Closed-form step estimate.
        steps: usize,
        /// Configured ceiling.
        limit: usize,
    },

    /// A bound module did not report an initialized state at arm time.
    #[error("Module '{0}' is not initialized")]
    ModuleNotInitialized(String),

    /// Actuator or detector binding does not match the expected order.
    #[error("Assignment error: {0}")]
    Assignment(String),

    /// A wait phase ran out of time.
    #[error("Timeout during {phase} after {budget:?}, still waiting for: {}", pending.join(", "))]
    Timeout {
        /// Name of the wait phase (`WaitMove` / `WaitGrab`).
        phase: String,
        /// Budget that elapsed.
        budget: Duration,
        /// Modules that never reported.
        pending: Vec<String>,
    },

    /// Storage allocation or write failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// I/O failure in the scan container.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Attribute (de)serialization failure in the scan container.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A hardware collaborator rejected a command.
    #[error("Instrument error: {0}")]
    Instrument(String),
}

impl DaqError {
    /// Category of this error, for programmatic dispatch.
    pub fn category(&self) -> ErrorCategory {
        match self {
            DaqError::Configuration(_)
            | DaqError::ConfigLoad(_)
            | DaqError::ScanTooLarge { .. }
            | DaqError::ModuleNotInitialized(_) => ErrorCategory::Configuration,
            DaqError::Assignment(_) => ErrorCategory::Assignment,
            DaqError::Timeout { .. } => ErrorCategory::Timeout,
            DaqError::Persistence(_) | DaqError::Io(_) | DaqError::Serialization(_) => {
                ErrorCategory::Persistence
            }
            DaqError::Instrument(_) => ErrorCategory::Hardware,
        }
    }

    /// Shorthand for `self.category() == ErrorCategory::Timeout`.
    pub fn is_timeout(&self) -> bool {
        self.category() == ErrorCategory::Timeout
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::ConfigLoad(Box::new(err))
    }
}
