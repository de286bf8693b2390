//! In-process coordination store.
//!
//! Thread-safe via `Mutex`-guarded maps and a `DashMap` of broadcast channels.
//! Expiry is lazy: expired keys are dropped when touched, or in bulk by
//! [`InMemoryStore::purge_expired`]. TTLs run on `tokio::time`, so tests can
//! drive them with a paused clock.

use crate::error::{StoreError, StoreResult};
use crate::store::{ChannelSubscription, CoordinationStore};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default per-channel broadcast buffer.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Inner {
    values: Mutex<HashMap<String, ValueEntry>>,
    sets: Mutex<HashMap<String, BTreeSet<String>>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    /// Woken on every list push so blocked pops re-check their keys.
    list_ready: Notify,
    channels: DashMap<String, broadcast::Sender<String>>,
    channel_capacity: usize,
    reachable: AtomicBool,
}

/// Coordination store living in the current process. Clones share state.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create an empty store with a custom per-channel broadcast buffer.
    pub fn with_channel_capacity(channel_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                values: Mutex::new(HashMap::new()),
                sets: Mutex::new(HashMap::new()),
                lists: Mutex::new(HashMap::new()),
                list_ready: Notify::new(),
                channels: DashMap::new(),
                channel_capacity: channel_capacity.max(1),
                reachable: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate losing (or regaining) the connection: while unreachable every
    /// operation fails with [`StoreError::Unavailable`].
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
        if reachable {
            debug!("In-memory store reachable");
        } else {
            warn!("In-memory store marked unreachable");
        }
    }

    /// Drop every expired string key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut values = self.lock_values();
        let before = values.len();
        values.retain(|_, entry| !entry.is_expired(now));
        before - values.len()
    }

    fn check_reachable(&self) -> StoreResult<()> {
        if self.inner.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store offline".into()))
        }
    }

    fn lock_values(&self) -> MutexGuard<'_, HashMap<String, ValueEntry>> {
        self.inner.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_sets(&self) -> MutexGuard<'_, HashMap<String, BTreeSet<String>>> {
        self.inner.sets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_lists(&self) -> MutexGuard<'_, HashMap<String, VecDeque<String>>> {
        self.inner.lists.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the live entry for `key`, evicting it if expired.
    fn live_value<'a>(
        values: &'a mut HashMap<String, ValueEntry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut ValueEntry> {
        if values.get(key).is_some_and(|e| e.is_expired(now)) {
            values.remove(key);
            return None;
        }
        values.get_mut(key)
    }

    fn try_pop(&self, keys: &[String]) -> Option<(String, String)> {
        let mut lists = self.lock_lists();
        for key in keys {
            if let Some(list) = lists.get_mut(key) {
                if let Some(value) = list.pop_front() {
                    if list.is_empty() {
                        lists.remove(key);
                    }
                    return Some((key.clone(), value));
                }
            }
        }
        None
    }

    fn push(&self, key: &str, value: &str, front: bool) -> usize {
        let len = {
            let mut lists = self.lock_lists();
            let list = lists.entry(key.to_string()).or_default();
            if front {
                list.push_front(value.to_string());
            } else {
                list.push_back(value.to_string());
            }
            list.len()
        };
        self.inner.list_ready.notify_waiters();
        len
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("channels", &self.inner.channels.len())
            .field("reachable", &self.inner.reachable.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check_reachable()
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut values = self.lock_values();
        if Self::live_value(&mut values, key, now).is_some() {
            return Ok(false);
        }
        values.insert(key.to_string(), ValueEntry::new(value, ttl));
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check_reachable()?;
        self.lock_values()
            .insert(key.to_string(), ValueEntry::new(value, ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut values = self.lock_values();
        Ok(Self::live_value(&mut values, key, now).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check_reachable()?;
        let now = Instant::now();
        let removed_value = self
            .lock_values()
            .remove(key)
            .is_some_and(|e| !e.is_expired(now));
        let removed_set = self.lock_sets().remove(key).is_some();
        let removed_list = self.lock_lists().remove(key).is_some();
        Ok(removed_value || removed_set || removed_list)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check_reachable()?;
        let now = Instant::now();
        if Self::live_value(&mut self.lock_values(), key, now).is_some() {
            return Ok(true);
        }
        Ok(self.lock_sets().contains_key(key) || self.lock_lists().contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut values = self.lock_values();
        match Self::live_value(&mut values, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_reachable()?;
        Ok(self
            .lock_sets()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_reachable()?;
        let mut sets = self.lock_sets();
        let Some(set) = sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            sets.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check_reachable()?;
        Ok(self
            .lock_sets()
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_push_front(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.check_reachable()?;
        Ok(self.push(key, value, true))
    }

    async fn list_push_back(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.check_reachable()?;
        Ok(self.push(key, value, false))
    }

    async fn list_pop_front(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> StoreResult<Option<(String, String)>> {
        self.check_reachable()?;
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.inner.list_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(hit) = self.try_pop(keys) {
                return Ok(Some(hit));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
            self.check_reachable()?;
        }
    }

    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check_reachable()?;
        Ok(self
            .lock_lists()
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_len(&self, key: &str) -> StoreResult<usize> {
        self.check_reachable()?;
        Ok(self.lock_lists().get(key).map(|l| l.len()).unwrap_or(0))
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        self.check_reachable()?;
        let delivered = match self.inner.channels.get(channel) {
            Some(sender) => sender.send(message.to_string()).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            self.inner
                .channels
                .remove_if(channel, |_, sender| sender.receiver_count() == 0);
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<ChannelSubscription> {
        self.check_reachable()?;
        let rx = {
            let capacity = self.inner.channel_capacity;
            let sender = self
                .inner
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(capacity).0);
            sender.subscribe()
        };

        let name = channel.to_string();
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let name = name.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(message) => return Some((message, rx)),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(channel = %name, skipped, "Subscriber lagged, messages dropped");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(ChannelSubscription::new(channel, stream.boxed()))
    }
}
