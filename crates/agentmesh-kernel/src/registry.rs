//! Agent registry: who is online and what they can do.
//!
//! Each agent has a durable record (`agent:{id}`) and a liveness key
//! (`agent:{id}:alive`) carrying the registry TTL. Heartbeats slide the TTL;
//! discovery only returns agents whose liveness key still exists, so a crashed
//! agent drops out of discovery once its TTL lapses without anyone cleaning up.
//!
//! Only registration and deregistration write the record. A heartbeat touches
//! the liveness key and its own timestamp key (`agent:{id}:heartbeat`), so it
//! can never put back capabilities that a concurrent re-registration replaced.

use agentmesh_store::CoordinationStore;
use agentmesh_types::config::RegistryConfig;
use agentmesh_types::{AgentId, AgentRecord, AgentStatus, Capability, MeshResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Set of every registered agent id.
const AGENTS_KEY: &str = "agents";

fn record_key(agent_id: &AgentId) -> String {
    format!("agent:{agent_id}")
}

fn alive_key(agent_id: &AgentId) -> String {
    format!("agent:{agent_id}:alive")
}

fn heartbeat_key(agent_id: &AgentId) -> String {
    format!("agent:{agent_id}:heartbeat")
}

/// Capability-indexed agent directory backed by the coordination store.
#[derive(Clone)]
pub struct AgentRegistry {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
}

impl AgentRegistry {
    /// Create a registry whose registrations lapse after `ttl` without a heartbeat.
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Create a registry from the `[registry]` config section.
    pub fn from_config(store: Arc<dyn CoordinationStore>, config: &RegistryConfig) -> Self {
        Self::new(store, config.ttl())
    }

    /// Liveness TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register or update an agent. Marks it online and starts its TTL.
    /// Capabilities dropped since the previous registration leave the index.
    pub async fn register(&self, mut record: AgentRecord) -> MeshResult<()> {
        let now = Utc::now();
        if let Some(previous) = self.get(&record.agent_id).await? {
            record.registered_at = previous.registered_at;
            for stale in previous.capabilities.difference(&record.capabilities) {
                self.store
                    .set_remove(&stale.agents_key(), record.agent_id.as_str())
                    .await?;
            }
        }
        record.status = AgentStatus::Online;
        record.last_heartbeat_at = now;

        self.write_record(&record).await?;
        for capability in &record.capabilities {
            self.store
                .set_add(&capability.agents_key(), record.agent_id.as_str())
                .await?;
        }
        self.store
            .set_add(AGENTS_KEY, record.agent_id.as_str())
            .await?;
        self.store
            .set(&alive_key(&record.agent_id), "1", Some(self.ttl))
            .await?;

        info!(
            agent = %record.agent_id,
            capabilities = record.capabilities.len(),
            "Agent registered"
        );
        Ok(())
    }

    /// Refresh an agent's TTL. Returns `false` (and changes nothing) for an
    /// agent that was never registered or has been deregistered.
    pub async fn heartbeat(&self, agent_id: &AgentId) -> MeshResult<bool> {
        let Some(record) = self.get(agent_id).await? else {
            debug!(agent = %agent_id, "Heartbeat for unknown agent ignored");
            return Ok(false);
        };
        if record.status == AgentStatus::Offline {
            debug!(agent = %agent_id, "Heartbeat for deregistered agent ignored");
            return Ok(false);
        }
        self.store
            .set(&heartbeat_key(agent_id), &Utc::now().to_rfc3339(), None)
            .await?;
        self.store
            .set(&alive_key(agent_id), "1", Some(self.ttl))
            .await?;
        debug!(agent = %agent_id, "Heartbeat");
        Ok(true)
    }

    /// Live agents advertising `capability`, ordered by id.
    pub async fn discover(&self, capability: &Capability) -> MeshResult<Vec<AgentRecord>> {
        let mut found = Vec::new();
        for member in self.store.set_members(&capability.agents_key()).await? {
            let agent_id = AgentId::new(member)?;
            if !self.is_live(&agent_id).await? {
                continue;
            }
            match self.get(&agent_id).await? {
                Some(record) if record.has_capability(capability) => found.push(record),
                _ => {
                    self.store
                        .set_remove(&capability.agents_key(), agent_id.as_str())
                        .await?;
                }
            }
        }
        debug!(capability = %capability, live = found.len(), "Discover");
        Ok(found)
    }

    /// Whether at least one live agent advertises `capability`.
    pub async fn has_live_agent(&self, capability: &Capability) -> MeshResult<bool> {
        for member in self.store.set_members(&capability.agents_key()).await? {
            if self.is_live(&AgentId::new(member)?).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether the agent's TTL is still running.
    pub async fn is_live(&self, agent_id: &AgentId) -> MeshResult<bool> {
        Ok(self.store.exists(&alive_key(agent_id)).await?)
    }

    /// Remove an agent from discovery immediately. Returns whether it was known.
    pub async fn deregister(&self, agent_id: &AgentId) -> MeshResult<bool> {
        let Some(mut record) = self.get(agent_id).await? else {
            return Ok(false);
        };
        for capability in &record.capabilities {
            self.store
                .set_remove(&capability.agents_key(), agent_id.as_str())
                .await?;
        }
        self.store.delete(&alive_key(agent_id)).await?;
        record.status = AgentStatus::Offline;
        self.write_record(&record).await?;
        info!(agent = %agent_id, "Agent deregistered");
        Ok(true)
    }

    /// Stored record for an agent, live or not.
    pub async fn get(&self, agent_id: &AgentId) -> MeshResult<Option<AgentRecord>> {
        let Some(raw) = self.store.get(&record_key(agent_id)).await? else {
            return Ok(None);
        };
        let mut record: AgentRecord = serde_json::from_str(&raw)?;
        let beat = self
            .store
            .get(&heartbeat_key(agent_id))
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| at.with_timezone(&Utc));
        if let Some(beat) = beat {
            record.last_heartbeat_at = record.last_heartbeat_at.max(beat);
        }
        Ok(Some(record))
    }

    /// Every stored record, live or not, ordered by id.
    pub async fn list(&self) -> MeshResult<Vec<AgentRecord>> {
        let mut records = Vec::new();
        for member in self.store.set_members(AGENTS_KEY).await? {
            if let Some(record) = self.get(&AgentId::new(member)?).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn write_record(&self, record: &AgentRecord) -> MeshResult<()> {
        let raw = serde_json::to_string(record)?;
        self.store
            .set(&record_key(&record.agent_id), &raw, None)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
