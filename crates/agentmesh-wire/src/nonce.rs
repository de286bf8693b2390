//! Replay protection: single-use nonce tracking.
//!
//! The authoritative record is a conditional set (`nonce:{scope}:{nonce}`)
//! with a TTL in the coordination store, so every process sharing the store
//! sees the same nonces. When the store cannot be reached the check falls
//! back to a bounded in-process cache; replay protection is then limited to
//! this process until the store comes back.

use agentmesh_store::CoordinationStore;
use agentmesh_types::config::EnvelopeConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Key prefix for nonce records.
const NONCE_PREFIX: &str = "nonce:";

/// Bounded nonce cache with TTL and least-recently-inserted eviction.
///
/// A nonce is only ever inserted once, so insertion order is also
/// recency-of-use order.
struct LocalNonceCache {
    expires: HashMap<String, Instant>,
    order: VecDeque<String>,
    capacity: usize,
}

impl LocalNonceCache {
    fn new(capacity: usize) -> Self {
        Self {
            expires: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns true if `key` was not present (and records it).
    fn check_and_insert(&mut self, key: &str, now: Instant, ttl: Duration) -> bool {
        self.evict_expired(now);
        if self.expires.contains_key(key) {
            return false;
        }
        self.expires.insert(key.to_string(), now + ttl);
        self.order.push_back(key.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.expires.remove(&oldest);
            }
        }
        true
    }

    fn evict_expired(&mut self, now: Instant) {
        // Constant TTL: the front of `order` always expires first.
        while let Some(front) = self.order.front() {
            match self.expires.get(front) {
                Some(at) if *at > now => break,
                _ => {
                    if let Some(key) = self.order.pop_front() {
                        self.expires.remove(&key);
                    }
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.expires.len()
    }
}

/// Shared nonce registry with an in-process fallback.
pub struct NonceStore {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
    fallback: Mutex<LocalNonceCache>,
    degraded: AtomicBool,
}

impl NonceStore {
    /// Create a nonce store remembering nonces for `ttl`.
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration, fallback_capacity: usize) -> Self {
        Self {
            store,
            ttl,
            fallback: Mutex::new(LocalNonceCache::new(fallback_capacity)),
            degraded: AtomicBool::new(false),
        }
    }

    /// Create a nonce store from the `[envelope]` config section.
    pub fn from_config(store: Arc<dyn CoordinationStore>, config: &EnvelopeConfig) -> Self {
        Self::new(store, config.nonce_ttl(), config.fallback_nonce_capacity)
    }

    /// How long nonces are remembered.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether the last check ran against the in-process fallback.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Atomically record `nonce` within `scope`. Returns `true` if the nonce is
    /// fresh, `false` if it was already used.
    pub async fn check_and_insert(&self, scope: &str, nonce: &str) -> bool {
        let key = nonce_key(scope, nonce);
        match self.store.set_nx(&key, "1", Some(self.ttl)).await {
            Ok(fresh) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!("Nonce store: coordination store reachable again, leaving degraded mode");
                }
                // Mirror into the local cache so an outage still catches
                // replays this process has already seen.
                self.lock_fallback()
                    .check_and_insert(&key, Instant::now(), self.ttl);
                if !fresh {
                    debug!(scope, "Nonce already recorded");
                }
                fresh
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    warn!(
                        error = %e,
                        "Nonce store: coordination store unreachable, replay protection degraded to this process"
                    );
                }
                self.lock_fallback()
                    .check_and_insert(&key, Instant::now(), self.ttl)
            }
        }
    }

    /// Number of nonces in the in-process cache.
    pub fn local_len(&self) -> usize {
        self.lock_fallback().len()
    }

    fn lock_fallback(&self) -> MutexGuard<'_, LocalNonceCache> {
        self.fallback.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for NonceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceStore")
            .field("ttl", &self.ttl)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

fn nonce_key(scope: &str, nonce: &str) -> String {
    if scope.is_empty() {
        format!("{NONCE_PREFIX}{nonce}")
    } else {
        format!("{NONCE_PREFIX}{scope}:{nonce}")
    }
}
