//! Coordination store for AgentMesh.
//!
//! Every cross-process invariant in the mesh (nonce uniqueness, queue item
//! exclusivity, registry TTLs) is enforced through the atomic primitives of a
//! shared store:
//!
//! - **Conditional set** with optional TTL (`set_nx`)
//! - **List push/pop**, including a blocking pop across several keys
//! - **Key expiry**
//! - **Publish/subscribe** channels
//!
//! [`CoordinationStore`] abstracts over the product providing them.
//! [`InMemoryStore`] is the in-process backend: clones share state, so agents
//! running as tasks of one process coordinate exactly as separate processes
//! would through a networked store.

mod cancel;
mod error;
mod memory;
mod store;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use store::{ChannelSubscription, CoordinationStore, MessageStream};
