//! MeshKernel: assembles the coordination components into a running node.

use crate::agent::{Agent, AgentHandle, AgentRuntime};
use crate::config::{default_config_path, try_load_config};
use crate::error::{KernelError, KernelResult};
use crate::mesh::EventMesh;
use crate::queue::WorkQueue;
use crate::registry::AgentRegistry;
use crate::supervisor::Supervisor;
use agentmesh_store::{CoordinationStore, InMemoryStore};
use agentmesh_types::config::MeshConfig;
use agentmesh_wire::{EnvelopeCodec, NonceStore, SigningIdentity, ToolClient, ToolServer, TrustStore};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One coordination node: registry, queue, mesh and the signing stack,
/// all sharing one coordination store.
pub struct MeshKernel {
    config: MeshConfig,
    store: Arc<dyn CoordinationStore>,
    codec: Arc<EnvelopeCodec>,
    trust: Arc<TrustStore>,
    registry: AgentRegistry,
    queue: WorkQueue,
    mesh: EventMesh,
    supervisor: Supervisor,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl MeshKernel {
    /// Boot a node on `store`.
    ///
    /// Fails fast on an invalid configuration or a store that does not answer
    /// a ping within `store.connect_timeout_ms`.
    pub async fn boot(config: MeshConfig, store: Arc<dyn CoordinationStore>) -> KernelResult<Arc<Self>> {
        config
            .validate()
            .map_err(|e| KernelError::BootFailed(e.to_string()))?;

        let connect_timeout = Duration::from_millis(config.store.connect_timeout_ms);
        match tokio::time::timeout(connect_timeout, store.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(KernelError::BootFailed(format!("coordination store: {e}")));
            }
            Err(_) => {
                return Err(KernelError::BootFailed(format!(
                    "coordination store did not answer within {}ms",
                    connect_timeout.as_millis()
                )));
            }
        }

        let nonces = Arc::new(NonceStore::from_config(Arc::clone(&store), &config.envelope));
        let codec = Arc::new(EnvelopeCodec::from_config(nonces, &config.envelope));
        let trust = Arc::new(TrustStore::new());
        let registry = AgentRegistry::from_config(Arc::clone(&store), &config.registry);
        let queue = WorkQueue::new(Arc::clone(&store), config.queue.clone());
        let mesh = EventMesh::new(
            Arc::clone(&store),
            registry.clone(),
            Arc::clone(&codec),
            Arc::clone(&trust),
            config.mesh.clone(),
        );
        let supervisor = Supervisor::new();

        let reaper = queue.spawn_reaper(
            Duration::from_secs(config.queue.reaper_interval_secs.max(1)),
            supervisor.cancel_signal(),
        );

        info!(
            registry_ttl_secs = config.registry.ttl_secs,
            nonce_ttl_secs = config.envelope.nonce_ttl_secs,
            max_attempts = config.queue.max_attempts,
            "Mesh kernel booted"
        );

        Ok(Arc::new(Self {
            config,
            store,
            codec,
            trust,
            registry,
            queue,
            mesh,
            supervisor,
            reaper: Mutex::new(Some(reaper)),
        }))
    }

    /// Boot a single-process node on a fresh [`InMemoryStore`].
    pub async fn boot_in_memory(config: MeshConfig) -> KernelResult<Arc<Self>> {
        let store = InMemoryStore::with_channel_capacity(config.store.channel_capacity.max(1));
        Self::boot(config, Arc::new(store)).await
    }

    /// Boot on `store` with configuration read from `path` (or
    /// `~/.agentmesh/config.toml`). A missing file boots with defaults; a file
    /// that exists but cannot be loaded fails the boot.
    pub async fn boot_from_file(
        path: Option<&Path>,
        store: Arc<dyn CoordinationStore>,
    ) -> KernelResult<Arc<Self>> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
        let config = if path.exists() {
            try_load_config(&path).map_err(|e| KernelError::BootFailed(format!("config: {e}")))?
        } else {
            info!(path = %path.display(), "Config file not found, using defaults");
            MeshConfig::default()
        };
        Self::boot(config, store).await
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn codec(&self) -> &Arc<EnvelopeCodec> {
        &self.codec
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn mesh(&self) -> &EventMesh {
        &self.mesh
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Create a signing identity whose key this node trusts.
    pub fn create_identity(&self, signer_id: impl Into<String>) -> Arc<SigningIdentity> {
        let identity = SigningIdentity::generate(signer_id);
        self.trust.trust_identity(&identity);
        Arc::new(identity)
    }

    /// A tool client signing as `identity`.
    pub fn tool_client(&self, identity: Arc<SigningIdentity>) -> ToolClient {
        ToolClient::new(identity, Arc::clone(&self.codec))
    }

    /// A tool server signing results as `identity` and accepting callers from
    /// this node's trust store.
    pub fn tool_server(&self, identity: Arc<SigningIdentity>) -> ToolServer {
        ToolServer::new(identity, Arc::clone(&self.codec), Arc::clone(&self.trust))
    }

    /// Start an agent on this node.
    pub async fn spawn_agent(self: &Arc<Self>, agent: Arc<dyn Agent>) -> KernelResult<AgentHandle> {
        AgentRuntime::spawn(agent, self).await
    }

    /// Signal every agent loop and background task to stop, then wait for
    /// the queue reaper to finish its current sweep.
    pub async fn shutdown(&self) {
        info!("Mesh kernel shutting down");
        self.supervisor.shutdown();
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reaper) = reaper {
            if let Err(e) = reaper.await {
                warn!(error = %e, "Queue reaper ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for MeshKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshKernel")
            .field("config", &self.config)
            .field("trusted_signers", &self.trust.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_types::{AgentId, AgentRecord, Capability, MeshError, WorkItem};
    use serde_json::json;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_boot_in_memory() {
        let kernel = MeshKernel::boot_in_memory(MeshConfig::default()).await.unwrap();
        let recon = Capability::new("recon").unwrap();

        kernel
            .registry()
            .register(AgentRecord::new(AgentId::new("scanner").unwrap(), [recon.clone()]))
            .await
            .unwrap();
        assert_eq!(kernel.registry().discover(&recon).await.unwrap().len(), 1);

        let id = kernel
            .queue()
            .push(WorkItem::new(recon.clone(), json!({"target": "10.0.0.5"})), 0)
            .await
            .unwrap();
        let item = kernel
            .queue()
            .pop(&[recon], Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(item.id, id);
        assert_ok!(kernel.queue().ack(id).await);

        kernel.shutdown().await;
        assert!(kernel.supervisor().is_shutting_down());
    }

    #[tokio::test]
    async fn test_boot_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[registry]\nttl_secs = 90\nheartbeat_interval_secs = 30\n").unwrap();

        let kernel = MeshKernel::boot_from_file(Some(&path), Arc::new(InMemoryStore::new()))
            .await
            .unwrap();
        assert_eq!(kernel.config().registry.ttl_secs, 90);
        kernel.shutdown().await;

        std::fs::write(&path, "[registry]\nttl_secs = 0\n").unwrap();
        let err = MeshKernel::boot_from_file(Some(&path), Arc::new(InMemoryStore::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::BootFailed(_)));
    }

    #[tokio::test]
    async fn test_boot_from_malformed_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[registry
ttl_secs = 90
").unwrap();
        let err = MeshKernel::boot_from_file(Some(&path), Arc::new(InMemoryStore::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::BootFailed(ref msg) if msg.starts_with("config:")));

        std::fs::write(&path, "include = [\"missing.toml\"]\n").unwrap();
        let err = MeshKernel::boot_from_file(Some(&path), Arc::new(InMemoryStore::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::BootFailed(_)));

        let missing = dir.path().join("absent.toml");
        let kernel = MeshKernel::boot_from_file(Some(&missing), Arc::new(InMemoryStore::new()))
            .await
            .unwrap();
        assert_eq!(kernel.config(), &MeshConfig::default());
        kernel.shutdown().await;
    }

    #[tokio::test]
    async fn test_boot_rejects_invalid_config() {
        let mut config = MeshConfig::default();
        config.envelope.nonce_ttl_secs = config.envelope.skew_tolerance_secs;
        let err = MeshKernel::boot_in_memory(config).await.unwrap_err();
        assert!(matches!(err, KernelError::BootFailed(ref msg) if msg.contains("nonce_ttl_secs")));
    }

    #[tokio::test]
    async fn test_boot_fails_fast_on_unreachable_store() {
        let store = InMemoryStore::new();
        store.set_reachable(false);
        let err = MeshKernel::boot(MeshConfig::default(), Arc::new(store))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::BootFailed(_)));
    }

    #[tokio::test]
    async fn test_identities_are_trusted() {
        let kernel = MeshKernel::boot_in_memory(MeshConfig::default()).await.unwrap();
        let identity = kernel.create_identity("planner");
        assert_eq!(
            kernel.trust().get("planner"),
            Some(identity.verifying_key())
        );

        let client = kernel.tool_client(Arc::clone(&identity));
        let server = kernel.tool_server(kernel.create_identity("toolhost"));
        let request = client.call("missing", json!({}));
        let result = server.handle(&request).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("unknown tool: missing"));
        assert!(client
            .verify_result(&request, &result, &server.identity().verifying_key())
            .await
            .is_accepted());
    }

    #[test]
    fn test_kernel_error_wraps_mesh_error() {
        let err: KernelError = MeshError::Cancelled.into();
        assert!(matches!(err, KernelError::Mesh(MeshError::Cancelled)));
    }
}
