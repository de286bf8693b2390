//! Event mesh: capability-addressed pub/sub between agents.
//!
//! Publishing sends one message on the store channel `capability:{name}`.
//! Every subscription listening on that channel at publish time gets one copy;
//! nothing is buffered for late subscribers and nothing is retried (use the
//! work queue for that).
//!
//! Each subscribed capability gets its own delivery task that reads the store
//! channel, verifies signed events, and hands events to the subscriber through
//! a bounded channel with non-blocking sends. A full channel drops the event
//! with a warning instead of stalling the fan-out.
//!
//! A signed event's envelope covers [`Event::signing_payload`], and the signer
//! must be the event's origin. Events arriving on a channel other than their
//! own capability's are dropped.

use crate::registry::AgentRegistry;
use crate::schema::SchemaRegistry;
use agentmesh_store::{cancel_pair, CancelHandle, CancelSignal, ChannelSubscription, CoordinationStore};
use agentmesh_types::config::EventMeshConfig;
use agentmesh_types::{AgentId, Capability, CapabilityPayload, Event, EventId, MeshError, MeshResult};
use agentmesh_wire::{EnvelopeCodec, SigningIdentity, TrustStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-publish switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Wrap the payload in a signed envelope.
    pub sign: bool,
    /// Fail with `Routing` unless a live agent advertises the capability.
    pub require_live_agent: bool,
}

impl PublishOptions {
    /// Signed, no routing check.
    pub fn signed() -> Self {
        Self {
            sign: true,
            require_live_agent: false,
        }
    }

    /// Also require a live agent for the capability.
    pub fn require_live_agent(mut self) -> Self {
        self.require_live_agent = true;
        self
    }
}

/// (agent, capability) pairs with an active listener, mapped to the owning
/// subscription.
type Listeners = DashMap<(AgentId, Capability), u64>;

/// A live subscription. Dropping it stops delivery.
pub struct Subscription {
    id: u64,
    agent_id: AgentId,
    capabilities: Vec<Capability>,
    rx: mpsc::Receiver<Event>,
    stop: CancelHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// The subscribing agent.
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Capabilities this subscription opened listeners for. Capabilities the
    /// agent was already listening on elsewhere are not repeated here.
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Next delivered event. `None` once every listener has stopped (or the
    /// subscription opened none).
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next event if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("agent_id", &self.agent_id)
            .field("capabilities", &self.capabilities)
            .field("listeners", &self.tasks.len())
            .finish()
    }
}

/// Capability-addressed event bus over the coordination store.
pub struct EventMesh {
    store: Arc<dyn CoordinationStore>,
    registry: AgentRegistry,
    codec: Arc<EnvelopeCodec>,
    trust: Arc<TrustStore>,
    schemas: Arc<SchemaRegistry>,
    config: EventMeshConfig,
    listeners: Arc<Listeners>,
    next_subscription: AtomicU64,
}

impl EventMesh {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        registry: AgentRegistry,
        codec: Arc<EnvelopeCodec>,
        trust: Arc<TrustStore>,
        config: EventMeshConfig,
    ) -> Self {
        Self {
            store,
            registry,
            codec,
            trust,
            schemas: Arc::new(SchemaRegistry::new()),
            config,
            listeners: Arc::new(DashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Payload schemas enforced at publish time.
    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Keys accepted on signed events.
    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Codec used to sign and verify events.
    pub fn codec(&self) -> &Arc<EnvelopeCodec> {
        &self.codec
    }

    /// Publish `payload` on `capability` as `origin`.
    pub async fn publish(
        &self,
        origin: &SigningIdentity,
        capability: &Capability,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> MeshResult<EventId> {
        self.publish_cancellable(origin, capability, payload, options, &CancelSignal::never())
            .await
    }

    /// Publish a typed payload on its own capability.
    pub async fn publish_typed<T: CapabilityPayload>(
        &self,
        origin: &SigningIdentity,
        payload: &T,
        options: PublishOptions,
    ) -> MeshResult<EventId> {
        let capability = T::capability()?;
        let payload = serde_json::to_value(payload)?;
        self.publish(origin, &capability, payload, options).await
    }

    /// Publish, giving up with `Cancelled` when `cancel` fires or `Timeout`
    /// after the configured publish timeout.
    pub async fn publish_cancellable(
        &self,
        origin: &SigningIdentity,
        capability: &Capability,
        payload: serde_json::Value,
        options: PublishOptions,
        cancel: &CancelSignal,
    ) -> MeshResult<EventId> {
        let timeout = self.config.publish_timeout();
        tokio::select! {
            _ = cancel.cancelled() => Err(MeshError::Cancelled),
            outcome = tokio::time::timeout(
                timeout,
                self.publish_inner(origin, capability, payload, options),
            ) => match outcome {
                Ok(result) => result,
                Err(_) => Err(MeshError::Timeout(format!(
                    "publish on '{capability}' exceeded {}ms",
                    timeout.as_millis()
                ))),
            },
        }
    }

    async fn publish_inner(
        &self,
        origin: &SigningIdentity,
        capability: &Capability,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> MeshResult<EventId> {
        self.schemas.validate(capability.as_str(), &payload)?;

        if options.require_live_agent && !self.registry.has_live_agent(capability).await? {
            return Err(MeshError::Routing(capability.to_string()));
        }

        let origin_id = AgentId::new(origin.signer_id())?;
        let mut event = Event::new(capability.clone(), payload, origin_id);
        if options.sign {
            event.envelope = Some(self.codec.sign(&event.signing_payload(), origin));
        }

        let raw = serde_json::to_string(&event)?;
        let receivers = self.store.publish(&capability.channel(), &raw).await?;
        debug!(
            event_id = %event.id,
            capability = %capability,
            origin = %event.origin_agent_id,
            signed = options.sign,
            receivers,
            "Event published"
        );
        Ok(event.id)
    }

    /// Start delivering events on `capabilities` to `agent_id`.
    ///
    /// Capabilities the agent already listens on (through another live
    /// subscription) are skipped, so an event is never delivered twice to the
    /// same agent.
    pub async fn subscribe(
        &self,
        agent_id: &AgentId,
        capabilities: &[Capability],
    ) -> MeshResult<Subscription> {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let (stop, stop_signal) = cancel_pair();

        let mut opened = Vec::new();
        let mut tasks = Vec::new();
        for capability in capabilities {
            let key = (agent_id.clone(), capability.clone());
            // Claim the slot before awaiting so a concurrent subscribe for the
            // same pair sees it taken.
            let reserved = match self.listeners.entry(key.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(id);
                    true
                }
            };
            if !reserved {
                debug!(agent = %agent_id, capability = %capability, "Already listening, skipped");
                continue;
            }

            let channel = match self.store.subscribe(&capability.channel()).await {
                Ok(channel) => channel,
                Err(e) => {
                    stop.cancel();
                    for held in opened.iter().chain(std::iter::once(capability)) {
                        self.listeners
                            .remove_if(&(agent_id.clone(), held.clone()), |_, owner| *owner == id);
                    }
                    return Err(e.into());
                }
            };

            let listener = Listener {
                subscription: id,
                key,
                codec: Arc::clone(&self.codec),
                trust: Arc::clone(&self.trust),
                listeners: Arc::clone(&self.listeners),
                verify: self.config.verify_signed_events,
                tx: tx.clone(),
            };
            tasks.push(tokio::spawn(listener.run(channel, stop_signal.clone())));
            opened.push(capability.clone());
        }

        info!(
            agent = %agent_id,
            subscription = id,
            capabilities = ?opened.iter().map(Capability::as_str).collect::<Vec<_>>(),
            "Subscribed"
        );
        Ok(Subscription {
            id,
            agent_id: agent_id.clone(),
            capabilities: opened,
            rx,
            stop,
            tasks,
        })
    }

    /// Stop delivery for `subscription`. Other subscriptions are unaffected.
    pub fn unsubscribe(&self, subscription: Subscription) {
        for capability in &subscription.capabilities {
            self.listeners.remove_if(
                &(subscription.agent_id.clone(), capability.clone()),
                |_, owner| *owner == subscription.id,
            );
        }
        info!(agent = %subscription.agent_id, subscription = subscription.id, "Unsubscribed");
        // Drop cancels the listener tasks.
    }

    /// Number of (agent, capability) listeners currently open.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl std::fmt::Debug for EventMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMesh")
            .field("config", &self.config)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

/// Delivery loop for one (agent, capability) pair.
struct Listener {
    subscription: u64,
    key: (AgentId, Capability),
    codec: Arc<EnvelopeCodec>,
    trust: Arc<TrustStore>,
    listeners: Arc<Listeners>,
    verify: bool,
    tx: mpsc::Sender<Event>,
}

impl Listener {
    async fn run(self, mut channel: ChannelSubscription, stop: CancelSignal) {
        let (agent_id, capability) = &self.key;
        loop {
            let raw = tokio::select! {
                _ = stop.cancelled() => break,
                raw = channel.recv() => match raw {
                    Some(raw) => raw,
                    None => {
                        debug!(agent = %agent_id, capability = %capability, "Channel closed");
                        break;
                    }
                },
            };

            let event: Event = match serde_json::from_str(&raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!(capability = %capability, error = %e, "Dropping malformed event");
                    continue;
                }
            };

            if event.capability != *capability {
                warn!(
                    target: "security",
                    event_id = %event.id,
                    agent = %agent_id,
                    channel = %capability,
                    claimed = %event.capability,
                    "Event on foreign channel dropped"
                );
                continue;
            }

            if self.verify {
                if let Some(envelope) = &event.envelope {
                    if envelope.signer_id != event.origin_agent_id.as_str() {
                        warn!(
                            target: "security",
                            event_id = %event.id,
                            agent = %agent_id,
                            origin = %event.origin_agent_id,
                            signer = %envelope.signer_id,
                            "Signer does not match origin, event rejected"
                        );
                        continue;
                    }
                    let verdict = self
                        .codec
                        .verify_trusted(
                            envelope,
                            &event.signing_payload(),
                            &self.trust,
                            agent_id.as_str(),
                        )
                        .await;
                    if let Some(reason) = verdict.reason() {
                        warn!(
                            target: "security",
                            event_id = %event.id,
                            agent = %agent_id,
                            origin = %event.origin_agent_id,
                            reason = %reason,
                            "Signed event rejected"
                        );
                        continue;
                    }
                }
            }

            match self.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    warn!(
                        agent = %agent_id,
                        capability = %capability,
                        event_id = %event.id,
                        "Subscriber buffer full, event dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
        self.listeners
            .remove_if(&self.key, |_, owner| *owner == self.subscription);
    }
}
