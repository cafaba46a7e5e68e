//! Error types for the convergence engine.
//!
//! Errors fall in two groups. Run-level errors ([`GraphError`],
//! [`StateError`], [`RegistryError`]) abort a run before or while it executes
//! and are returned to the caller as [`Error`]. Resource-level errors
//! ([`ProviderError`], wrapped in [`ResourceError`]) are captured and attached
//! to the outcome of the resource that produced them.

use crate::types::Operation;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Whether a failed provider call is worth repeating.
///
/// Consumed by [`crate::retry::with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient failure (e.g. material written by another resource is not
    /// readable yet)
    Retryable,
    /// Permanent failure
    Fatal,
}

/// Graph construction errors. Fatal: no resource is executed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The dependency relation contains a cycle
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    Cycle {
        /// Resource IDs along the cycle, first element repeated at the end
        path: Vec<String>,
    },

    /// An edge references a resource that is not part of the graph
    #[error("resource '{from}' depends on unknown resource '{to}'")]
    Dangling { from: String, to: String },

    /// Two resources share the same ID
    #[error("duplicate resource id '{0}'")]
    DuplicateId(String),
}

/// Errors returned by provider implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// No factory registered for the resource type
    #[error("no provider registered for resource type '{0}'")]
    UnknownType(String),

    /// The provider rejected its configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Permanent failure of a lifecycle call
    #[error("{0}")]
    Failed(String),

    /// Transient failure of a lifecycle call
    #[error("{0} (retryable)")]
    Retryable(String),

    /// An external system did not reach its ready condition in time
    #[error("timed out after {}s waiting for {target}", .timeout.as_secs())]
    HealthCheckTimeout { target: String, timeout: Duration },

    /// The call observed the run's cancellation signal
    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Build a permanent failure from any displayable error
    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }

    /// Build a transient failure from any displayable error
    pub fn retryable(err: impl std::fmt::Display) -> Self {
        Self::Retryable(err.to_string())
    }

    /// Retry classification of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Retryable(_) => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }

    /// Whether this error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// A provider error attributed to the lifecycle operation that raised it.
///
/// `operation == Create` is the create error of the taxonomy, and so on;
/// a [`ProviderError::HealthCheckTimeout`] raised from `Create` is the
/// health-check specialisation of a create error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed: {source}")]
pub struct ResourceError {
    pub operation: Operation,
    #[source]
    pub source: ProviderError,
}

impl ResourceError {
    pub fn new(operation: Operation, source: ProviderError) -> Self {
        Self { operation, source }
    }

    /// Whether the failure was a health-check timeout
    pub fn is_health_check_timeout(&self) -> bool {
        matches!(self.source, ProviderError::HealthCheckTimeout { .. })
    }
}

/// State persistence errors. Fatal to the whole run.
#[derive(Debug, Error)]
pub enum StateError {
    /// Reading, writing or renaming the state file failed
    #[error("failed to {action} state file {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The state file exists but cannot be parsed
    #[error("state file {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The in-memory state could not be serialized
    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Provider registry construction errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Two factories were registered for the same resource type
    #[error("resource type '{0}' registered twice")]
    Duplicate(String),
}

/// Run-level errors returned from engine entry points
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The worker pool could not be created
    #[error("failed to create worker pool: {0}")]
    Pool(String),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
