//! Shutdown broadcast and handler failure accounting.

use agentmesh_store::{cancel_pair, CancelHandle, CancelSignal};
use agentmesh_types::AgentId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Kernel-wide shutdown flag plus handler failure counters.
pub struct Supervisor {
    shutdown: CancelHandle,
    failure_count: AtomicU64,
    agent_failures: DashMap<AgentId, u32>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown, _) = cancel_pair();
        Self {
            shutdown,
            failure_count: AtomicU64::new(0),
            agent_failures: DashMap::new(),
        }
    }

    /// Fires once [`Supervisor::shutdown`] has been called, including for
    /// signals taken afterwards.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.shutdown.signal()
    }

    /// Ask every agent loop and background task to wind down. Repeat calls
    /// are no-ops.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Supervisor: initiating graceful shutdown");
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Record a failed handler invocation. Returns the agent's running count.
    pub fn record_failure(&self, agent_id: &AgentId) -> u32 {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let mut count = self.agent_failures.entry(agent_id.clone()).or_insert(0);
        *count += 1;
        warn!(
            agent = %agent_id,
            failures = *count,
            total_failures = self.failure_count.load(Ordering::Relaxed),
            "Agent handler failure recorded"
        );
        *count
    }

    /// Total handler failures.
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Handler failures for one agent.
    pub fn agent_failure_count(&self, agent_id: &AgentId) -> u32 {
        self.agent_failures.get(agent_id).map(|r| *r).unwrap_or(0)
    }

    /// Get a health summary.
    pub fn health(&self) -> SupervisorHealth {
        SupervisorHealth {
            is_shutting_down: self.is_shutting_down(),
            failure_count: self.failure_count(),
            failing_agents: self.agent_failures.len(),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Health report from the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHealth {
    pub is_shutting_down: bool,
    pub failure_count: u64,
    pub failing_agents: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown() {
        let supervisor = Supervisor::new();
        assert!(!supervisor.is_shutting_down());
        supervisor.shutdown();
        assert!(supervisor.is_shutting_down());
    }

    #[tokio::test]
    async fn test_late_signal_sees_shutdown() {
        let supervisor = Supervisor::new();
        supervisor.shutdown();
        supervisor.shutdown();
        let signal = supervisor.cancel_signal();
        assert!(signal.is_cancelled());
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn test_cancel_signal_fires_on_shutdown() {
        let supervisor = Supervisor::new();
        let signal = supervisor.cancel_signal();
        assert!(!signal.is_cancelled());
        supervisor.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(1), signal.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn test_failure_tracking() {
        let supervisor = Supervisor::new();
        let a = AgentId::new("a").unwrap();
        let b = AgentId::new("b").unwrap();
        assert_eq!(supervisor.record_failure(&a), 1);
        assert_eq!(supervisor.record_failure(&a), 2);
        supervisor.record_failure(&b);

        assert_eq!(supervisor.agent_failure_count(&a), 2);
        assert_eq!(supervisor.failure_count(), 3);
        let health = supervisor.health();
        assert_eq!(health.failing_agents, 2);
        assert!(!health.is_shutting_down);
    }
}
