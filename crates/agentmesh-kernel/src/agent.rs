//! Agent runtime: runs an [`Agent`] on a kernel.
//!
//! A spawned agent gets a signing identity trusted by the node, a registry
//! record, a heartbeat loop and one mesh subscription covering its
//! capabilities. Each delivered event is passed to [`Agent::handle`]; the
//! follow-up events it returns are published under the agent's identity, so
//! pipelines emerge from agents reacting to each other's output.

use crate::error::KernelResult;
use crate::heartbeat::spawn_heartbeat;
use crate::kernel::MeshKernel;
use crate::mesh::{PublishOptions, Subscription};
use agentmesh_store::{cancel_pair, CancelHandle, CancelSignal};
use agentmesh_types::{AgentId, AgentRecord, Capability, CapabilityPayload, Event, MeshResult};
use agentmesh_wire::SigningIdentity;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A capability-driven participant in the mesh.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Stable agent id; also the signer id of its events.
    fn id(&self) -> AgentId;

    /// Capabilities the agent serves and listens on.
    fn capabilities(&self) -> Vec<Capability>;

    /// React to one delivered event.
    async fn handle(&self, event: Event) -> MeshResult<AgentOutcome>;
}

/// An event an agent wants published after handling.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowUp {
    pub capability: Capability,
    pub payload: serde_json::Value,
    pub options: PublishOptions,
}

/// What a handler produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutcome {
    pub follow_ups: Vec<FollowUp>,
}

impl AgentOutcome {
    /// Nothing to publish.
    pub fn done() -> Self {
        Self::default()
    }

    /// Add an unsigned follow-up.
    pub fn publish(mut self, capability: Capability, payload: serde_json::Value) -> Self {
        self.follow_ups.push(FollowUp {
            capability,
            payload,
            options: PublishOptions::default(),
        });
        self
    }

    /// Add a signed follow-up.
    pub fn publish_signed(mut self, capability: Capability, payload: serde_json::Value) -> Self {
        self.follow_ups.push(FollowUp {
            capability,
            payload,
            options: PublishOptions::signed(),
        });
        self
    }

    /// Add a typed follow-up on its own capability.
    pub fn publish_typed<T: CapabilityPayload>(
        mut self,
        payload: &T,
        options: PublishOptions,
    ) -> MeshResult<Self> {
        self.follow_ups.push(FollowUp {
            capability: T::capability()?,
            payload: serde_json::to_value(payload)?,
            options,
        });
        Ok(self)
    }
}

/// A running agent. Dropping the handle leaves the agent running until the
/// kernel shuts down; call [`AgentHandle::stop`] to end it earlier.
#[derive(Debug)]
pub struct AgentHandle {
    agent_id: AgentId,
    identity: Arc<SigningIdentity>,
    stop: CancelHandle,
    task: JoinHandle<()>,
}

impl AgentHandle {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// The identity the agent signs with.
    pub fn identity(&self) -> &Arc<SigningIdentity> {
        &self.identity
    }

    /// Whether the handler loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the agent and wait until it has deregistered.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(agent = %self.agent_id, error = %e, "Agent loop ended abnormally");
        }
    }
}

/// Spawns agents onto a kernel.
pub struct AgentRuntime;

impl AgentRuntime {
    /// Register `agent`, start its heartbeat, subscribe it to its
    /// capabilities and start its handler loop.
    pub async fn spawn(agent: Arc<dyn Agent>, kernel: &Arc<MeshKernel>) -> KernelResult<AgentHandle> {
        let agent_id = agent.id();
        let capabilities = agent.capabilities();
        let identity = kernel.create_identity(agent_id.as_str());

        kernel
            .registry()
            .register(AgentRecord::new(agent_id.clone(), capabilities.iter().cloned()))
            .await?;
        let subscription = match kernel.mesh().subscribe(&agent_id, &capabilities).await {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Err(cleanup) = kernel.registry().deregister(&agent_id).await {
                    warn!(agent = %agent_id, error = %cleanup, "Deregister after failed subscribe");
                }
                return Err(e.into());
            }
        };

        let (stop, stop_signal) = cancel_pair();
        let (beat_stop, beat_signal) = cancel_pair();
        spawn_heartbeat(
            kernel.registry().clone(),
            agent_id.clone(),
            kernel.config().registry.heartbeat_interval(),
            beat_signal,
        );

        let worker = AgentLoop {
            agent,
            agent_id: agent_id.clone(),
            identity: Arc::clone(&identity),
            kernel: Arc::clone(kernel),
        };
        let shutdown = kernel.supervisor().cancel_signal();
        let task = tokio::spawn(async move {
            worker.run(subscription, stop_signal, shutdown).await;
            beat_stop.cancel();
        });

        info!(agent = %agent_id, capabilities = capabilities.len(), "Agent spawned");
        Ok(AgentHandle {
            agent_id,
            identity,
            stop,
            task,
        })
    }
}

struct AgentLoop {
    agent: Arc<dyn Agent>,
    agent_id: AgentId,
    identity: Arc<SigningIdentity>,
    kernel: Arc<MeshKernel>,
}

impl AgentLoop {
    async fn run(self, mut subscription: Subscription, stop: CancelSignal, shutdown: CancelSignal) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!(agent = %self.agent_id, "Agent stop requested");
                    break;
                }
                _ = shutdown.cancelled() => {
                    debug!(agent = %self.agent_id, "Agent loop: shutdown signal received");
                    break;
                }
                event = subscription.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => {
                        warn!(agent = %self.agent_id, "Subscription closed, agent loop exiting");
                        break;
                    }
                },
            }
        }

        self.kernel.mesh().unsubscribe(subscription);
        if let Err(e) = self.kernel.registry().deregister(&self.agent_id).await {
            warn!(agent = %self.agent_id, error = %e, "Deregister on exit failed");
        }
        info!(agent = %self.agent_id, "Agent stopped");
    }

    async fn dispatch(&self, event: Event) {
        let event_id = event.id;
        let capability = event.capability.clone();
        let outcome = match self.agent.handle(event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.kernel.supervisor().record_failure(&self.agent_id);
                warn!(
                    agent = %self.agent_id,
                    event_id = %event_id,
                    capability = %capability,
                    error = %e,
                    "Agent handler failed"
                );
                return;
            }
        };

        for follow_up in outcome.follow_ups {
            let published = self
                .kernel
                .mesh()
                .publish(
                    &self.identity,
                    &follow_up.capability,
                    follow_up.payload,
                    follow_up.options,
                )
                .await;
            if let Err(e) = published {
                warn!(
                    agent = %self.agent_id,
                    caused_by = %event_id,
                    capability = %follow_up.capability,
                    error = %e,
                    "Follow-up publish failed"
                );
            }
        }
    }
}
