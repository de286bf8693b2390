//! Store wrapper that injects failures and pauses for interleaving tests.

use agentmesh_store::{ChannelSubscription, CoordinationStore, InMemoryStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Both sides of a paused `get`: `reached` fires once the read has happened,
/// the caller stays parked until `release` is notified.
#[derive(Clone)]
pub(crate) struct Gate {
    pub reached: Arc<Notify>,
    pub release: Arc<Notify>,
}

/// An [`InMemoryStore`] that fails scripted operations once and can park a
/// caller right after it reads a chosen key.
pub(crate) struct ScriptedStore {
    inner: InMemoryStore,
    failures: Mutex<HashMap<&'static str, usize>>,
    gates: Mutex<HashMap<String, Gate>>,
    yield_on_subscribe: bool,
}

impl ScriptedStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            yield_on_subscribe: false,
        }
    }

    /// Make `subscribe` yield before answering, like a networked store.
    pub fn yielding_subscribe(mut self) -> Self {
        self.yield_on_subscribe = true;
        self
    }

    /// Fail the next call of `op` (the trait method name).
    pub fn fail_next(&self, op: &'static str) {
        *self.failures.lock().unwrap().entry(op).or_insert(0) += 1;
    }

    /// Park the next `get(key)` after it has read the value.
    pub fn pause_after_get(&self, key: &str) -> Gate {
        let gate = Gate {
            reached: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        self.gates
            .lock()
            .unwrap()
            .insert(key.to_string(), gate.clone());
        gate
    }

    fn check(&self, op: &'static str) -> StoreResult<()> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(StoreError::Unavailable(format!("{op}: connection reset")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl CoordinationStore for ScriptedStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check("ping")?;
        self.inner.ping().await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        self.check("set_nx")?;
        self.inner.set_nx(key, value, ttl).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check("set")?;
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check("get")?;
        let value = self.inner.get(key).await?;
        let gate = self.gates.lock().unwrap().remove(key);
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }
        Ok(value)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check("delete")?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check("exists")?;
        self.inner.exists(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check("expire")?;
        self.inner.expire(key, ttl).await
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check("set_add")?;
        self.inner.set_add(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check("set_remove")?;
        self.inner.set_remove(key, member).await
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check("set_members")?;
        self.inner.set_members(key).await
    }

    async fn list_push_front(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.check("list_push_front")?;
        self.inner.list_push_front(key, value).await
    }

    async fn list_push_back(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.check("list_push_back")?;
        self.inner.list_push_back(key, value).await
    }

    async fn list_pop_front(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> StoreResult<Option<(String, String)>> {
        self.check("list_pop_front")?;
        self.inner.list_pop_front(keys, timeout).await
    }

    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check("list_range")?;
        self.inner.list_range(key).await
    }

    async fn list_len(&self, key: &str) -> StoreResult<usize> {
        self.check("list_len")?;
        self.inner.list_len(key).await
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        self.check("publish")?;
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<ChannelSubscription> {
        self.check("subscribe")?;
        if self.yield_on_subscribe {
            tokio::task::yield_now().await;
        }
        self.inner.subscribe(channel).await
    }
}
