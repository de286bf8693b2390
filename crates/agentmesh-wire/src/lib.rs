//! AgentMesh wire layer: signed envelopes and tool invocation.
//!
//! Every payload that crosses an agent boundary with integrity requirements is
//! wrapped in an [`Envelope`](agentmesh_types::Envelope): SHA-256 over the
//! canonical JSON payload, an Ed25519 signature over `(timestamp, payload_hash)`
//! bound to the nonce and signer, and a single-use nonce.
//!
//! ## Architecture
//!
//! - **NonceStore**: atomic check-and-insert of nonces in the coordination
//!   store, with a bounded in-process fallback when the store is down
//! - **EnvelopeCodec**: sign / verify (hash → signature → skew → nonce)
//! - **TrustStore**: maps signer ids to public keys on the receiving side
//! - **ToolClient / ToolServer**: signed request/response for remote tools
//! - **transport**: length-prefixed JSON frames over TCP

pub mod canonical;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod message;
pub mod nonce;
pub mod tool;
pub mod transport;

pub use envelope::{EnvelopeCodec, SignedMessage};
pub use error::WireError;
pub use identity::{SigningIdentity, TrustStore};
pub use message::{WireMessage, WireMessageKind};
pub use nonce::NonceStore;
pub use tool::{Tool, ToolClient, ToolServer};
pub use transport::serve_tools;
