//! Work items distributed through the priority work queue.

use crate::capability::Capability;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new random TaskId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work. Held by at most one consumer between pop and ack/nack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Task id.
    pub id: TaskId,
    /// Capability that routes the item to a queue.
    pub capability: Capability,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// Priority given at push time; > 0 means head-of-queue.
    pub priority: i32,
    /// 1-based number of the delivery attempt the item is on.
    pub attempt_count: u32,
    /// When the producer created the item.
    pub created_at: DateTime<Utc>,
    /// While held by a consumer: when the hold lapses and the item is redelivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_deadline: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Create a new item on its first attempt.
    pub fn new(capability: Capability, payload: serde_json::Value) -> Self {
        Self {
            id: TaskId::new(),
            capability,
            payload,
            priority: 0,
            attempt_count: 1,
            created_at: Utc::now(),
            visibility_deadline: None,
        }
    }

    /// Whether the retry budget is used up.
    pub fn attempts_exhausted(&self, max_attempts: u32) -> bool {
        self.attempt_count >= max_attempts
    }
}
