//! Capability identifiers and the store key conventions derived from them.
//!
//! A capability names a unit of work an agent can perform (e.g. `"analysis"`).
//! Capabilities have no hierarchy: routing is exact-string matching. The key
//! layout below is shared with agents written in other languages, so it must
//! stay stable.

use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix for mesh channels and queue keys.
pub const CHANNEL_PREFIX: &str = "capability:";

/// A capability name, validated on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Capability(String);

impl Capability {
    /// Create a capability. Names must be non-empty and contain no whitespace
    /// or `:` (the key separator).
    pub fn new(name: impl Into<String>) -> MeshResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(MeshError::InvalidInput("capability name is empty".into()));
        }
        if name.chars().any(|c| c.is_whitespace() || c == ':') {
            return Err(MeshError::InvalidInput(format!(
                "capability name '{name}' contains whitespace or ':'"
            )));
        }
        Ok(Self(name))
    }

    /// The raw capability name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Pub/sub channel for events tagged with this capability: `capability:{name}`.
    pub fn channel(&self) -> String {
        format!("{CHANNEL_PREFIX}{}", self.0)
    }

    /// Ready list for work items. Same string as the channel; lists and
    /// channels live in separate namespaces of the store.
    pub fn queue_key(&self) -> String {
        self.channel()
    }

    /// Dead-letter list: `capability:{name}:dead_letter`.
    pub fn dead_letter_key(&self) -> String {
        format!("{CHANNEL_PREFIX}{}:dead_letter", self.0)
    }

    /// Registry index of agents advertising this capability.
    pub fn agents_key(&self) -> String {
        format!("{CHANNEL_PREFIX}{}:agents", self.0)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Capability {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Capability {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.0
    }
}

/// Parse a list of capability names, failing on the first invalid one.
pub fn parse_capabilities<I, S>(names: I) -> MeshResult<Vec<Capability>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Capability::new).collect()
}
