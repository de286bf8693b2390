//! Shared error types for the AgentMesh system.

use crate::envelope::RejectReason;
use thiserror::Error;

/// Top-level error type for mesh, queue, registry and envelope operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// The coordination store could not be reached.
    #[error("Coordination backend unavailable: {0}")]
    BackendUnavailable(String),

    /// No live agent advertises the requested capability.
    #[error("No live agent for capability: {0}")]
    Routing(String),

    /// A blocking operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// An envelope failed verification.
    #[error("Envelope rejected: {0}")]
    Rejected(RejectReason),

    /// A task exhausted its retry budget and was moved to the dead-letter list.
    #[error("Task {task_id} dead-lettered after {attempts} attempts")]
    DeadLettered {
        /// The dead-lettered task.
        task_id: String,
        /// How many attempts were made.
        attempts: u32,
    },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// The task is not held by any consumer (already acked or reclaimed).
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A payload did not match the schema registered for its capability.
    #[error("Payload rejected for capability '{capability}': {reason}")]
    Schema {
        /// Capability the payload was published under.
        capability: String,
        /// Why validation failed.
        reason: String,
    },

    /// Invalid caller input (bad capability name, empty id, ...).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl MeshError {
    /// Whether the caller may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Alias for Result with MeshError.
pub type MeshResult<T> = Result<T, MeshError>;
