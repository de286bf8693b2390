//! Core kernel for AgentMesh.
//!
//! Assembles the coordination components (event mesh, work queue, agent
//! registry) over a shared coordination store and runs agents on top of them.

pub mod agent;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod kernel;
pub mod logging;
pub mod mesh;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentHandle, AgentOutcome, AgentRuntime, FollowUp};
pub use error::{KernelError, KernelResult};
pub use kernel::MeshKernel;
pub use mesh::{EventMesh, PublishOptions, Subscription};
pub use queue::WorkQueue;
pub use registry::AgentRegistry;
pub use schema::SchemaRegistry;
pub use supervisor::Supervisor;
