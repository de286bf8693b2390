//! Priority work queue with visibility timeouts and dead-lettering.
//!
//! Ready items sit in a per-capability list (`capability:{name}`). Popping an
//! item moves it into a hold record (`queue:inflight:{id}`) guarded by a lease
//! key (`queue:lease:{id}`) whose TTL is the visibility timeout. Ack deletes the
//! hold. When a lease lapses, the next reclaim pass claims the hold by deleting
//! it (only one claimant can win that delete) and puts the item back with its
//! attempt counter bumped, or dead-letters it once the budget is spent.
//!
//! Nacked items wait out a backoff in a `Delayed` hold, then rejoin the list.
//! Delivery is at-least-once: a slow consumer whose lease lapsed may finish
//! work on an item that has already been redelivered.
//!
//! No transition is atomic across keys. Whenever a step has taken an item out
//! of one place (the ready list or a hold) and a later write fails, the item is
//! put back where it was, so a store error can cause a duplicate delivery but
//! never a lost item.

use crate::retry::RetryConfig;
use agentmesh_store::{CancelSignal, CoordinationStore};
use agentmesh_types::config::QueueConfig;
use agentmesh_types::{Capability, MeshError, MeshResult, TaskId, WorkItem};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Set of task ids with a hold record.
const INFLIGHT_SET: &str = "queue:inflight";

fn hold_key(id: &str) -> String {
    format!("queue:inflight:{id}")
}

fn lease_key(id: &str) -> String {
    format!("queue:lease:{id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum HoldState {
    /// Held by a consumer until ack/nack or lease expiry.
    InFlight,
    /// Nacked; waiting out its backoff before it is visible again.
    Delayed,
}

#[derive(Debug, Serialize, Deserialize)]
struct Hold {
    state: HoldState,
    item: WorkItem,
}

/// Per-capability work queue shared by every consumer of the store.
#[derive(Clone)]
pub struct WorkQueue {
    store: Arc<dyn CoordinationStore>,
    config: QueueConfig,
    backoff: RetryConfig,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn CoordinationStore>, config: QueueConfig) -> Self {
        let backoff = RetryConfig::from_queue(&config);
        Self {
            store,
            config,
            backoff,
        }
    }

    /// Queue settings in effect.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue an item. `priority > 0` jumps to the head of the queue;
    /// anything else joins the tail.
    pub async fn push(&self, mut item: WorkItem, priority: i32) -> MeshResult<TaskId> {
        item.priority = priority;
        item.visibility_deadline = None;
        let id = item.id;
        self.enqueue(&item).await?;
        debug!(task = %id, capability = %item.capability, priority, "Task pushed");
        Ok(id)
    }

    /// Wait up to `timeout` for an item on any of `capabilities` (earlier
    /// capabilities are checked first).
    pub async fn pop(&self, capabilities: &[Capability], timeout: Duration) -> MeshResult<WorkItem> {
        self.pop_cancellable(capabilities, timeout, &CancelSignal::never())
            .await
    }

    /// Like [`WorkQueue::pop`], returning `Cancelled` as soon as `cancel` fires.
    pub async fn pop_cancellable(
        &self,
        capabilities: &[Capability],
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> MeshResult<WorkItem> {
        if capabilities.is_empty() {
            return Err(MeshError::InvalidInput(
                "pop needs at least one capability".to_string(),
            ));
        }
        let keys: Vec<String> = capabilities.iter().map(Capability::queue_key).collect();
        let deadline = Instant::now() + timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(MeshError::Cancelled);
            }
            // Consumers double as reapers so expired holds come back even
            // without a dedicated reaper task.
            self.reclaim_expired().await?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let slice = remaining.min(self.config.poll_interval());
            let popped = tokio::select! {
                _ = cancel.cancelled() => return Err(MeshError::Cancelled),
                popped = self.store.list_pop_front(&keys, slice) => popped?,
            };

            if let Some((key, raw)) = popped {
                match serde_json::from_str::<WorkItem>(&raw) {
                    Ok(item) => {
                        let id = item.id.to_string();
                        return match self.hold(item).await {
                            Ok(item) => Ok(item),
                            Err(e) => {
                                self.return_unheld(&key, &raw, &id).await;
                                Err(e)
                            }
                        };
                    }
                    Err(e) => {
                        warn!(queue = %key, error = %e, "Unreadable task moved to dead letters");
                        self.store
                            .list_push_back(&format!("{key}:dead_letter"), &raw)
                            .await?;
                        continue;
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(MeshError::Timeout(format!(
                    "no task for [{}] within {}ms",
                    capabilities
                        .iter()
                        .map(Capability::as_str)
                        .collect::<Vec<_>>()
                        .join(", "),
                    timeout.as_millis()
                )));
            }
        }
    }

    /// Acknowledge a held item, removing it for good.
    pub async fn ack(&self, task_id: TaskId) -> MeshResult<()> {
        let id = task_id.to_string();
        let (hold, _) = self.claim_inflight(&id).await?;
        self.forget(&id).await;
        debug!(task = %id, capability = %hold.item.capability, "Task acked");
        Ok(())
    }

    /// Give a held item back.
    ///
    /// With `requeue` and budget left, the item returns after a backoff with
    /// its attempt counter bumped. Otherwise it moves to the dead-letter list
    /// and `DeadLettered` is returned.
    pub async fn nack(&self, task_id: TaskId, requeue: bool) -> MeshResult<()> {
        let id = task_id.to_string();
        let (Hold { item, .. }, raw) = self.claim_inflight(&id).await?;
        match self.settle_nack(&id, item, requeue).await {
            Ok(None) => Ok(()),
            Ok(Some(dead)) => Err(dead),
            Err(e) => {
                self.restore_hold(&id, &raw).await;
                Err(e)
            }
        }
    }

    /// Requeue or dead-letter a claimed item. Returns the `DeadLettered`
    /// error when the item was buried.
    async fn settle_nack(
        &self,
        id: &str,
        mut item: WorkItem,
        requeue: bool,
    ) -> MeshResult<Option<MeshError>> {
        if !requeue || item.attempts_exhausted(self.config.max_attempts) {
            return self.dead_letter(item).await.map(Some);
        }

        item.attempt_count += 1;
        item.visibility_deadline = None;
        // attempt_count is now 2 on the first retry; backoff indexes from 0.
        let delay = self.backoff.delay(item.attempt_count.saturating_sub(2));

        if delay.is_zero() {
            self.enqueue(&item).await?;
            self.forget(id).await;
        } else {
            let hold = Hold {
                state: HoldState::Delayed,
                item,
            };
            // Lease first: a hold without a live lease is fair game for reclaim.
            self.store.set(&lease_key(id), "delayed", Some(delay)).await?;
            self.store
                .set(&hold_key(id), &serde_json::to_string(&hold)?, None)
                .await?;
        }
        debug!(task = %id, delay_ms = delay.as_millis() as u64, "Task nacked, requeue scheduled");
        Ok(None)
    }

    /// Return every hold whose lease lapsed: in-flight items with budget left
    /// and delayed items go back on their queue, exhausted ones are
    /// dead-lettered. Returns how many items were moved.
    pub async fn reclaim_expired(&self) -> MeshResult<usize> {
        let mut moved = 0;
        for id in self.store.set_members(INFLIGHT_SET).await? {
            if self.store.exists(&lease_key(&id)).await? {
                continue;
            }
            let Some(raw) = self.store.get(&hold_key(&id)).await? else {
                continue;
            };
            // Deleting the hold is the claim; losing the race means another
            // consumer (or an ack) got there first.
            if !self.store.delete(&hold_key(&id)).await? {
                continue;
            }
            let hold: Hold = match serde_json::from_str(&raw) {
                Ok(hold) => hold,
                Err(e) => {
                    warn!(task = %id, error = %e, "Dropping unreadable hold record");
                    self.store.set_remove(INFLIGHT_SET, &id).await?;
                    continue;
                }
            };

            if let Err(e) = self.release_expired(&id, hold).await {
                self.restore_hold(&id, &raw).await;
                return Err(e);
            }
            moved += 1;
        }
        Ok(moved)
    }

    /// Put a claimed expired hold back in circulation or bury it.
    async fn release_expired(&self, id: &str, hold: Hold) -> MeshResult<()> {
        let mut item = hold.item;
        item.visibility_deadline = None;
        match hold.state {
            HoldState::Delayed => {
                self.enqueue(&item).await?;
                self.forget(id).await;
                debug!(task = %id, attempt = item.attempt_count, "Delayed task visible again");
            }
            HoldState::InFlight if item.attempts_exhausted(self.config.max_attempts) => {
                warn!(task = %id, attempts = item.attempt_count, "Visibility timeout on last attempt");
                self.dead_letter(item).await?;
            }
            HoldState::InFlight => {
                item.attempt_count += 1;
                self.enqueue(&item).await?;
                self.forget(id).await;
                info!(task = %id, attempt = item.attempt_count, "Visibility timeout, task redelivered");
            }
        }
        Ok(())
    }

    /// Run [`WorkQueue::reclaim_expired`] every `interval` until `cancel` fires.
    pub fn spawn_reaper(&self, interval: Duration, cancel: CancelSignal) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Queue reaper stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                match queue.reclaim_expired().await {
                    Ok(0) => {}
                    Ok(n) => debug!(reclaimed = n, "Queue reaper pass"),
                    Err(e) => warn!(error = %e, "Queue reaper pass failed"),
                }
            }
        })
    }

    /// Items dead-lettered for `capability`, oldest first.
    pub async fn dead_letters(&self, capability: &Capability) -> MeshResult<Vec<WorkItem>> {
        let mut items = Vec::new();
        for raw in self.store.list_range(&capability.dead_letter_key()).await? {
            match serde_json::from_str(&raw) {
                Ok(item) => items.push(item),
                Err(e) => warn!(capability = %capability, error = %e, "Unreadable dead letter"),
            }
        }
        Ok(items)
    }

    /// Drop the dead-letter list for `capability`. Returns how many were removed.
    pub async fn purge_dead_letters(&self, capability: &Capability) -> MeshResult<usize> {
        let key = capability.dead_letter_key();
        let count = self.store.list_len(&key).await?;
        self.store.delete(&key).await?;
        info!(capability = %capability, count, "Dead letters purged");
        Ok(count)
    }

    /// Number of items ready on `capability` (excludes held items).
    pub async fn len(&self, capability: &Capability) -> MeshResult<usize> {
        Ok(self.store.list_len(&capability.queue_key()).await?)
    }

    async fn enqueue(&self, item: &WorkItem) -> MeshResult<()> {
        let raw = serde_json::to_string(item)?;
        let key = item.capability.queue_key();
        if item.priority > 0 {
            self.store.list_push_front(&key, &raw).await?;
        } else {
            self.store.list_push_back(&key, &raw).await?;
        }
        Ok(())
    }

    async fn hold(&self, mut item: WorkItem) -> MeshResult<WorkItem> {
        let visibility = self.config.visibility_timeout();
        item.visibility_deadline = chrono::Duration::from_std(visibility)
            .ok()
            .map(|d| Utc::now() + d);
        let id = item.id.to_string();
        let hold = Hold {
            state: HoldState::InFlight,
            item,
        };
        self.store
            .set(&lease_key(&id), "held", Some(visibility))
            .await?;
        self.store
            .set(&hold_key(&id), &serde_json::to_string(&hold)?, None)
            .await?;
        self.store.set_add(INFLIGHT_SET, &id).await?;
        debug!(task = %id, attempt = hold.item.attempt_count, "Task popped");
        Ok(hold.item)
    }

    /// Take ownership of an in-flight hold, or fail with `TaskNotFound`.
    async fn claim_inflight(&self, id: &str) -> MeshResult<(Hold, String)> {
        let raw = self
            .store
            .get(&hold_key(id))
            .await?
            .ok_or_else(|| MeshError::TaskNotFound(id.to_string()))?;
        let hold: Hold = serde_json::from_str(&raw)?;
        if hold.state != HoldState::InFlight {
            return Err(MeshError::TaskNotFound(id.to_string()));
        }
        if !self.store.delete(&hold_key(id)).await? {
            return Err(MeshError::TaskNotFound(id.to_string()));
        }
        Ok((hold, raw))
    }

    /// Rewrite a hold this consumer claimed but could not settle. It has no
    /// live lease once the old one lapses, so reclaim picks it up again.
    async fn restore_hold(&self, id: &str, raw: &str) {
        if let Err(e) = self.store.set(&hold_key(id), raw, None).await {
            error!(task = %id, error = %e, hold = %raw, "Task lost: hold could not be restored");
        }
    }

    /// Return a popped item to the head of its list after `hold` failed, and
    /// clear whatever part of the hold was written.
    async fn return_unheld(&self, key: &str, raw: &str, id: &str) {
        if let Err(e) = self.store.list_push_front(key, raw).await {
            error!(task = %id, queue = %key, error = %e, item = %raw, "Task lost: could not return it to its queue");
            return;
        }
        warn!(task = %id, queue = %key, "Hold failed, task returned to the head of its queue");
        if let Err(e) = self.store.delete(&hold_key(id)).await {
            debug!(task = %id, error = %e, "Partial hold left behind");
        }
        self.forget(id).await;
    }

    /// Drop the lease and in-flight membership of a settled item. Failures
    /// leave only inert bookkeeping behind, so they are logged and ignored.
    async fn forget(&self, id: &str) {
        if let Err(e) = self.store.set_remove(INFLIGHT_SET, id).await {
            debug!(task = %id, error = %e, "Stale in-flight entry left behind");
        }
        if let Err(e) = self.store.delete(&lease_key(id)).await {
            debug!(task = %id, error = %e, "Stale lease left behind");
        }
    }

    /// Move an item to its dead-letter list. Returns the error reported to
    /// the consumer that gave it up.
    async fn dead_letter(&self, mut item: WorkItem) -> MeshResult<MeshError> {
        let id = item.id.to_string();
        item.visibility_deadline = None;
        self.store
            .list_push_back(&item.capability.dead_letter_key(), &serde_json::to_string(&item)?)
            .await?;
        self.forget(&id).await;
        warn!(
            task = %id,
            capability = %item.capability,
            attempts = item.attempt_count,
            "Task dead-lettered"
        );
        Ok(MeshError::DeadLettered {
            task_id: id,
            attempts: item.attempt_count,
        })
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
