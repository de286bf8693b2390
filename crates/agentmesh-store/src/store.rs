//! The [`CoordinationStore`] trait.

use crate::error::StoreResult;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;

/// Stream of raw messages received on a channel.
pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// A live subscription to one pub/sub channel.
///
/// Messages published before the subscription existed are never seen.
/// Dropping the subscription stops delivery.
pub struct ChannelSubscription {
    channel: String,
    stream: MessageStream,
}

impl ChannelSubscription {
    /// Wrap a backend message stream.
    pub fn new(channel: impl Into<String>, stream: MessageStream) -> Self {
        Self {
            channel: channel.into(),
            stream,
        }
    }

    /// The channel this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message. `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.stream.next().await
    }
}

impl std::fmt::Debug for ChannelSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSubscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Shared coordination store.
///
/// Strings, sets and lists share one keyspace; pub/sub channels have their own.
/// Only string keys carry TTLs.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Round-trip to the store.
    async fn ping(&self) -> StoreResult<()>;

    /// Set `key` only if it does not exist. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool>;

    /// Set `key` unconditionally, replacing any TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Read a string key.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Delete a key of any type. Returns whether something was removed; callers
    /// use this as an atomic claim.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Whether a string key exists and has not expired.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Reset the TTL of an existing string key. Returns false if the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Add a member to a set. Returns whether it was newly added.
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Remove a member from a set. Returns whether it was present.
    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// All members of a set, in sorted order.
    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Insert at the head of a list. Returns the new length.
    async fn list_push_front(&self, key: &str, value: &str) -> StoreResult<usize>;

    /// Append to the tail of a list. Returns the new length.
    async fn list_push_back(&self, key: &str, value: &str) -> StoreResult<usize>;

    /// Pop the head of the first non-empty list among `keys`, waiting up to
    /// `timeout` for one to become non-empty. Returns `(key, value)`.
    async fn list_pop_front(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> StoreResult<Option<(String, String)>>;

    /// Every element of a list, head first.
    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Length of a list (0 if missing).
    async fn list_len(&self, key: &str) -> StoreResult<usize>;

    /// Publish to a channel. Returns how many subscribers received it.
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> StoreResult<ChannelSubscription>;
}
