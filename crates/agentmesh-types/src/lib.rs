//! Core types for the AgentMesh coordination substrate.
//!
//! This crate defines the data model shared by the store, wire protocol and
//! kernel crates: capabilities, agent records, events, work items, signed
//! envelopes, tool calls, configuration and the error taxonomy. It contains
//! no business logic.

pub mod agent;
pub mod capability;
pub mod config;
pub mod envelope;
pub mod error;
pub mod event;
pub mod task;
pub mod tool;

pub use agent::{AgentId, AgentRecord, AgentStatus};
pub use capability::Capability;
pub use envelope::{Envelope, RejectReason, Verification};
pub use error::{MeshError, MeshResult};
pub use event::{CapabilityPayload, Event, EventId};
pub use task::{TaskId, WorkItem};
pub use tool::{ToolCallRequest, ToolCallResult};
