//! Agent identity and registry record types.

use crate::capability::Capability;
use crate::error::{MeshError, MeshResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Unique identifier for an agent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Create an agent id. Blank ids are rejected.
    pub fn new(id: impl Into<String>) -> MeshResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(MeshError::InvalidInput("agent id is empty".to_string()));
        }
        Ok(Self(id))
    }

    /// Generate a random agent id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registration status of an agent.
///
/// Liveness is not stored here: a record whose heartbeat TTL lapsed keeps its
/// last status but is excluded from discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Registered and accepting work.
    Online,
    /// Explicitly deregistered.
    Offline,
}

/// A registry entry describing an agent and what it can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent id.
    pub agent_id: AgentId,
    /// Capabilities the agent advertises.
    pub capabilities: BTreeSet<Capability>,
    /// Registration status.
    pub status: AgentStatus,
    /// When the agent first registered.
    pub registered_at: DateTime<Utc>,
    /// When the last heartbeat (or registration) arrived.
    pub last_heartbeat_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Build a fresh online record.
    pub fn new(agent_id: AgentId, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        let now = Utc::now();
        Self {
            agent_id,
            capabilities: capabilities.into_iter().collect(),
            status: AgentStatus::Online,
            registered_at: now,
            last_heartbeat_at: now,
        }
    }

    /// Whether the agent advertises the capability (exact match).
    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }
}
