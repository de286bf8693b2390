//! Heartbeats and liveness reports.
//!
//! Each running agent gets a background task that refreshes its registry TTL
//! on a fixed interval. A beat that hits a store outage is retried with
//! backoff; if the outage outlasts the retries the beat is skipped and the
//! next tick tries again. Should the outage outlast the TTL, the agent drops
//! out of discovery until a beat lands.

use crate::registry::AgentRegistry;
use crate::retry::{retry_async, RetryConfig, RetryOutcome};
use agentmesh_store::CancelSignal;
use agentmesh_types::{AgentId, AgentStatus, MeshError, MeshResult};
use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Spawn the heartbeat loop for one agent. Stops when `cancel` fires.
pub fn spawn_heartbeat(
    registry: AgentRegistry,
    agent_id: AgentId,
    interval: Duration,
    cancel: CancelSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let retry = RetryConfig::heartbeat(interval);
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; registration already started the TTL.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(agent = %agent_id, "Heartbeat loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let outcome = retry_async(
                &retry,
                || registry.heartbeat(&agent_id),
                MeshError::is_retryable,
            )
            .await;
            match outcome {
                RetryOutcome::Success { result: true, .. } => {}
                RetryOutcome::Success { result: false, .. } => {
                    info!(agent = %agent_id, "Agent no longer registered, heartbeat loop exiting");
                    return;
                }
                RetryOutcome::Exhausted { last_error, attempts } => {
                    warn!(
                        agent = %agent_id,
                        attempts,
                        error = %last_error,
                        "Heartbeat failed, will retry next interval"
                    );
                }
            }
        }
    })
}

/// Liveness of one registered agent.
#[derive(Debug, Clone)]
pub struct HeartbeatStatus {
    /// Agent ID.
    pub agent_id: AgentId,
    /// Seconds since the last heartbeat landed.
    pub inactive_secs: i64,
    /// Whether the registry TTL lapsed.
    pub unresponsive: bool,
}

/// Check every online agent in the registry.
pub async fn check_agents(registry: &AgentRegistry) -> MeshResult<Vec<HeartbeatStatus>> {
    let now = Utc::now();
    let mut statuses = Vec::new();

    for record in registry.list().await? {
        if record.status != AgentStatus::Online {
            continue;
        }
        let inactive_secs = (now - record.last_heartbeat_at).num_seconds();
        let unresponsive = !registry.is_live(&record.agent_id).await?;

        if unresponsive {
            warn!(agent = %record.agent_id, inactive_secs, "Agent is unresponsive");
        } else {
            debug!(agent = %record.agent_id, inactive_secs, "Agent heartbeat OK");
        }

        statuses.push(HeartbeatStatus {
            agent_id: record.agent_id,
            inactive_secs,
            unresponsive,
        });
    }

    Ok(statuses)
}

/// Aggregate heartbeat summary.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatSummary {
    /// Total agents checked.
    pub total_checked: usize,
    /// Number of responsive agents.
    pub responsive: usize,
    /// Number of unresponsive agents.
    pub unresponsive: usize,
    /// Details of unresponsive agents.
    pub unresponsive_agents: Vec<HeartbeatStatus>,
}

/// Produce a summary from heartbeat statuses.
pub fn summarize(statuses: &[HeartbeatStatus]) -> HeartbeatSummary {
    let unresponsive_agents: Vec<HeartbeatStatus> = statuses
        .iter()
        .filter(|s| s.unresponsive)
        .cloned()
        .collect();

    HeartbeatSummary {
        total_checked: statuses.len(),
        responsive: statuses.len() - unresponsive_agents.len(),
        unresponsive: unresponsive_agents.len(),
        unresponsive_agents,
    }
}
