//! Event types carried by the capability-addressed mesh.

use crate::agent::AgentId;
use crate::capability::Capability;
use crate::envelope::Envelope;
use crate::error::{MeshError, MeshResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Create a new random EventId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A strongly-typed payload bound to one capability.
///
/// Implement this for each message schema so handlers decode structs instead
/// of poking at JSON maps.
pub trait CapabilityPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The capability this payload is published under.
    const CAPABILITY: &'static str;

    /// The capability as a validated value.
    fn capability() -> MeshResult<Capability> {
        Capability::new(Self::CAPABILITY)
    }
}

/// An event published on the mesh. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id.
    pub id: EventId,
    /// Routing capability.
    pub capability: Capability,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// When the event was published.
    pub published_at: DateTime<Utc>,
    /// The publishing agent.
    pub origin_agent_id: AgentId,
    /// Signature over [`Event::signing_payload`], present when published with
    /// signing enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
}

impl Event {
    /// Create an unsigned event.
    pub fn new(capability: Capability, payload: serde_json::Value, origin: AgentId) -> Self {
        Self {
            id: EventId::new(),
            capability,
            payload,
            published_at: Utc::now(),
            origin_agent_id: origin,
            envelope: None,
        }
    }

    /// What the envelope covers: the payload together with the event id,
    /// capability and origin. Moving a signed payload to another capability or
    /// claiming it for another origin breaks the hash.
    pub fn signing_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "capability": self.capability,
            "origin_agent_id": self.origin_agent_id,
            "payload": self.payload,
        })
    }

    /// Whether the event carries an envelope.
    pub fn is_signed(&self) -> bool {
        self.envelope.is_some()
    }

    /// Decode the payload into its typed schema.
    ///
    /// Fails if the event was published under a different capability.
    pub fn decode<T: CapabilityPayload>(&self) -> MeshResult<T> {
        if self.capability.as_str() != T::CAPABILITY {
            return Err(MeshError::Schema {
                capability: self.capability.to_string(),
                reason: format!("expected capability '{}'", T::CAPABILITY),
            });
        }
        serde_json::from_value(self.payload.clone()).map_err(|e| MeshError::Schema {
            capability: self.capability.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct ReconRequest {
        target: String,
    }

    impl CapabilityPayload for ReconRequest {
        const CAPABILITY: &'static str = "recon";
    }

    #[test]
    fn test_decode_typed_payload() {
        let event = Event::new(
            ReconRequest::capability().unwrap(),
            json!({"target": "10.0.0.5"}),
            AgentId::new("scout").unwrap(),
        );
        let req: ReconRequest = event.decode().unwrap();
        assert_eq!(req.target, "10.0.0.5");
        assert!(!event.is_signed());
    }

    #[test]
    fn test_decode_wrong_capability() {
        let event = Event::new(
            Capability::new("reporting").unwrap(),
            json!({"target": "10.0.0.5"}),
            AgentId::new("scout").unwrap(),
        );
        assert!(matches!(
            event.decode::<ReconRequest>(),
            Err(MeshError::Schema { .. })
        ));
    }

    #[test]
    fn test_unsigned_event_omits_envelope_key() {
        let event = Event::new(
            Capability::new("analysis").unwrap(),
            json!({}),
            AgentId::new("a").unwrap(),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("envelope").is_none());
        assert_eq!(json["capability"], "analysis");
    }

    #[test]
    fn test_signing_payload_binds_capability_and_origin() {
        let event = Event::new(
            Capability::new("recon").unwrap(),
            json!({"target": "10.0.0.5"}),
            AgentId::new("scout").unwrap(),
        );
        let body = event.signing_payload();
        assert_eq!(body["capability"], "recon");
        assert_eq!(body["origin_agent_id"], "scout");
        assert_eq!(body["payload"]["target"], "10.0.0.5");

        let mut moved = event.clone();
        moved.capability = Capability::new("exploit").unwrap();
        assert_ne!(moved.signing_payload(), body);
    }
}
