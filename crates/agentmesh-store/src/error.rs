use agentmesh_types::MeshError;
use thiserror::Error;

/// Errors raised by a coordination store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unreachable: {0}")]
    Unavailable(String),

    /// The store answered with something the client cannot interpret.
    #[error("store protocol error: {0}")]
    Protocol(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for MeshError {
    fn from(e: StoreError) -> Self {
        MeshError::BackendUnavailable(e.to_string())
    }
}
