//! Payload schemas per capability.
//!
//! A capability with a registered [`CapabilityPayload`] type only accepts
//! payloads that deserialize into it. Unregistered capabilities accept any
//! JSON.

use agentmesh_types::{CapabilityPayload, MeshError, MeshResult};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

type Validator = Arc<dyn Fn(&serde_json::Value) -> Result<(), String> + Send + Sync>;

/// Capability name → payload validator.
#[derive(Default)]
pub struct SchemaRegistry {
    validators: DashMap<String, Validator>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `T` to its capability. Replaces any earlier binding.
    pub fn register<T: CapabilityPayload>(&self) {
        let validator: Validator = Arc::new(|payload: &serde_json::Value| {
            serde_json::from_value::<T>(payload.clone())
                .map(|_| ())
                .map_err(|e| e.to_string())
        });
        self.validators.insert(T::CAPABILITY.to_string(), validator);
        debug!(capability = T::CAPABILITY, schema = std::any::type_name::<T>(), "Schema registered");
    }

    /// Whether a schema is bound to `capability`.
    pub fn contains(&self, capability: &str) -> bool {
        self.validators.contains_key(capability)
    }

    /// Check a payload against the schema bound to `capability`, if any.
    pub fn validate(&self, capability: &str, payload: &serde_json::Value) -> MeshResult<()> {
        let validator = self
            .validators
            .get(capability)
            .map(|entry| Arc::clone(entry.value()));
        match validator {
            Some(validate) => validate(payload).map_err(|reason| MeshError::Schema {
                capability: capability.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.validators.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("SchemaRegistry")
            .field("capabilities", &names)
            .finish()
    }
}
