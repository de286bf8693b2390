//! Kernel-specific error types.

use agentmesh_types::MeshError;
use thiserror::Error;

/// Kernel error type wrapping MeshError with kernel-specific context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped MeshError.
    #[error(transparent)]
    Mesh(#[from] MeshError),

    /// The kernel failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
