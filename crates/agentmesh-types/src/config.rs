//! Configuration types for an AgentMesh node.
//!
//! Every section is `#[serde(default)]`, so a config file only needs to list
//! the values it overrides.

use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level node configuration (`agentmesh.toml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Agent registry settings.
    pub registry: RegistryConfig,
    /// Envelope signing/verification settings.
    pub envelope: EnvelopeConfig,
    /// Work queue settings.
    pub queue: QueueConfig,
    /// Event mesh settings.
    pub mesh: EventMeshConfig,
    /// Coordination store settings.
    pub store: StoreConfig,
    /// Logging settings.
    pub log: LogConfig,
}

impl MeshConfig {
    /// Reject configurations the node cannot safely run with.
    pub fn validate(&self) -> MeshResult<()> {
        if self.registry.ttl_secs == 0 {
            return Err(MeshError::Config("registry.ttl_secs must be > 0".into()));
        }
        if self.registry.heartbeat_interval_secs == 0
            || self.registry.heartbeat_interval_secs >= self.registry.ttl_secs
        {
            return Err(MeshError::Config(format!(
                "registry.heartbeat_interval_secs must be in 1..{}",
                self.registry.ttl_secs
            )));
        }
        if self.envelope.skew_tolerance_secs == 0 {
            return Err(MeshError::Config(
                "envelope.skew_tolerance_secs must be > 0".into(),
            ));
        }
        // A nonce must outlive every timestamp that could still pass the skew check.
        if self.envelope.nonce_ttl_secs < 2 * self.envelope.skew_tolerance_secs {
            return Err(MeshError::Config(format!(
                "envelope.nonce_ttl_secs ({}) must be at least twice skew_tolerance_secs ({})",
                self.envelope.nonce_ttl_secs, self.envelope.skew_tolerance_secs
            )));
        }
        if self.envelope.fallback_nonce_capacity == 0 {
            return Err(MeshError::Config(
                "envelope.fallback_nonce_capacity must be > 0".into(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(MeshError::Config("queue.max_attempts must be > 0".into()));
        }
        if self.queue.visibility_timeout_secs == 0 {
            return Err(MeshError::Config(
                "queue.visibility_timeout_secs must be > 0".into(),
            ));
        }
        if self.queue.retry_min_delay_ms > self.queue.retry_max_delay_ms {
            return Err(MeshError::Config(
                "queue.retry_min_delay_ms must not exceed retry_max_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.queue.retry_jitter) {
            return Err(MeshError::Config(
                "queue.retry_jitter must be within 0.0..=1.0".into(),
            ));
        }
        if self.queue.poll_interval_ms == 0 {
            return Err(MeshError::Config("queue.poll_interval_ms must be > 0".into()));
        }
        if self.mesh.subscriber_buffer == 0 {
            return Err(MeshError::Config("mesh.subscriber_buffer must be > 0".into()));
        }
        if self.store.channel_capacity == 0 {
            return Err(MeshError::Config("store.channel_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Agent registry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Seconds a registration stays discoverable without a heartbeat.
    pub ttl_secs: u64,
    /// Seconds between heartbeats emitted by agent runtimes.
    pub heartbeat_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            heartbeat_interval_secs: 20,
        }
    }
}

impl RegistryConfig {
    /// Registration TTL.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Envelope signing/verification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    /// Maximum accepted distance between an envelope timestamp and now.
    pub skew_tolerance_secs: u64,
    /// How long a consumed nonce is remembered.
    pub nonce_ttl_secs: u64,
    /// Entries kept by the in-process nonce cache used when the store is down.
    pub fallback_nonce_capacity: usize,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            skew_tolerance_secs: 60,
            nonce_ttl_secs: 300,
            fallback_nonce_capacity: 10_000,
        }
    }
}

impl EnvelopeConfig {
    /// Skew tolerance.
    pub fn skew_tolerance(&self) -> Duration {
        Duration::from_secs(self.skew_tolerance_secs)
    }

    /// Nonce TTL.
    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_secs)
    }
}

/// Work queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Delivery attempts before an item is dead-lettered.
    pub max_attempts: u32,
    /// Seconds a popped item stays hidden from other consumers.
    pub visibility_timeout_secs: u64,
    /// Backoff before the first requeue after a nack.
    pub retry_min_delay_ms: u64,
    /// Backoff ceiling.
    pub retry_max_delay_ms: u64,
    /// Jitter factor (0.0 = none, 1.0 = up to double).
    pub retry_jitter: f64,
    /// Slice length for blocking pops; expired holds are reclaimed between slices.
    pub poll_interval_ms: u64,
    /// Seconds between background reclaim sweeps.
    pub reaper_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            visibility_timeout_secs: 30,
            retry_min_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            retry_jitter: 0.2,
            poll_interval_ms: 250,
            reaper_interval_secs: 5,
        }
    }
}

impl QueueConfig {
    /// Visibility timeout.
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Blocking pop slice.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Event mesh settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventMeshConfig {
    /// Events buffered per subscription before new ones are dropped.
    pub subscriber_buffer: usize,
    /// Upper bound on a single publish.
    pub publish_timeout_ms: u64,
    /// Verify signed events before handing them to subscribers.
    pub verify_signed_events: bool,
}

impl Default for EventMeshConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            publish_timeout_ms: 5_000,
            verify_signed_events: true,
        }
    }
}

impl EventMeshConfig {
    /// Publish timeout.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Coordination store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Per-channel buffer of the in-process pub/sub backend.
    pub channel_capacity: usize,
    /// How long boot waits for the store to answer a ping.
    pub connect_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            connect_timeout_ms: 2_000,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
