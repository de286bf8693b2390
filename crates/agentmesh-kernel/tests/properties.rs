//! End-to-end coordination properties across the store, wire and kernel crates.

use agentmesh_kernel::{AgentRegistry, EventMesh, MeshKernel, PublishOptions, WorkQueue};
use agentmesh_store::{CoordinationStore, InMemoryStore};
use agentmesh_types::config::{EventMeshConfig, MeshConfig, QueueConfig};
use agentmesh_types::{
    AgentId, AgentRecord, Capability, Event, MeshError, RejectReason, Verification, WorkItem,
};
use agentmesh_wire::{EnvelopeCodec, NonceStore, SigningIdentity, TrustStore};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn cap(name: &str) -> Capability {
    Capability::new(name).unwrap()
}

fn agent(id: &str) -> AgentId {
    AgentId::new(id).unwrap()
}

fn codec(store: &Arc<dyn CoordinationStore>) -> EnvelopeCodec {
    let nonces = Arc::new(NonceStore::new(
        Arc::clone(store),
        Duration::from_secs(300),
        1024,
    ));
    EnvelopeCodec::new(nonces, Duration::from_secs(60))
}

fn shared_store() -> Arc<dyn CoordinationStore> {
    Arc::new(InMemoryStore::new())
}

#[tokio::test]
async fn envelope_round_trip_and_tamper_detection() {
    let store = shared_store();
    let codec = codec(&store);
    let planner = SigningIdentity::generate("planner");
    let payload = json!({"target": "10.0.0.5", "ports": [22, 443]});

    let envelope = codec.sign(&payload, &planner);
    assert_eq!(
        codec.verify(&envelope, &payload, &planner.verifying_key()).await,
        Verification::Accepted
    );

    let fresh = codec.sign(&payload, &planner);
    let tampered = json!({"target": "10.0.0.6", "ports": [22, 443]});
    assert_eq!(
        codec.verify(&fresh, &tampered, &planner.verifying_key()).await,
        Verification::Rejected(RejectReason::HashMismatch)
    );
}

#[tokio::test]
async fn replay_is_rejected_across_codecs_sharing_a_store() {
    let store = shared_store();
    let first = codec(&store);
    let second = codec(&store);
    let planner = SigningIdentity::generate("planner");
    let payload = json!({"step": 1});

    let envelope = first.sign(&payload, &planner);
    assert!(first
        .verify(&envelope, &payload, &planner.verifying_key())
        .await
        .is_accepted());
    assert_eq!(
        second
            .verify(&envelope, &payload, &planner.verifying_key())
            .await,
        Verification::Rejected(RejectReason::Replayed)
    );
}

#[tokio::test]
async fn envelopes_outside_skew_are_expired() {
    let store = shared_store();
    let codec = codec(&store);
    let planner = SigningIdentity::generate("planner");
    let payload = json!({});

    for offset in [-61i64, 61] {
        let stamped = Utc::now() + chrono::Duration::seconds(offset);
        let envelope = codec.sign_at(&payload, &planner, stamped);
        assert_eq!(
            codec
                .verify(&envelope, &payload, &planner.verifying_key())
                .await,
            Verification::Rejected(RejectReason::Expired)
        );
    }
}

#[tokio::test(start_paused = true)]
async fn discovery_excludes_agents_whose_ttl_lapsed() {
    let store = shared_store();
    let registry = AgentRegistry::new(Arc::clone(&store), Duration::from_secs(60));
    registry
        .register(AgentRecord::new(agent("a"), [cap("recon")]))
        .await
        .unwrap();
    registry
        .register(AgentRecord::new(agent("b"), [cap("recon")]))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(registry.heartbeat(&agent("b")).await.unwrap());
    tokio::time::advance(Duration::from_secs(31)).await;

    let live: Vec<String> = registry
        .discover(&cap("recon"))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.agent_id.to_string())
        .collect();
    assert_eq!(live, vec!["b"]);
}

#[tokio::test(start_paused = true)]
async fn queue_redelivers_then_dead_letters() {
    let store = shared_store();
    let queue = WorkQueue::new(Arc::clone(&store), QueueConfig::default());
    let caps = [cap("analysis")];

    // Unacked item comes back once its visibility timeout lapses.
    let id = queue
        .push(WorkItem::new(cap("analysis"), json!({"host": "10.0.0.5"})), 0)
        .await
        .unwrap();
    let first = queue.pop(&caps, Duration::from_secs(1)).await.unwrap();
    assert_eq!(first.attempt_count, 1);
    tokio::time::advance(Duration::from_secs(31)).await;
    let second = queue.pop(&caps, Duration::from_secs(1)).await.unwrap();
    assert_eq!(second.id, id);
    assert_eq!(second.attempt_count, 2);
    queue.ack(id).await.unwrap();

    // Three nacks exhaust the default budget.
    let doomed = queue
        .push(WorkItem::new(cap("analysis"), json!({"host": "10.0.0.6"})), 0)
        .await
        .unwrap();
    let mut last = None;
    for _ in 0..3 {
        let item = queue.pop(&caps, Duration::from_secs(60)).await.unwrap();
        assert_eq!(item.id, doomed);
        last = Some(queue.nack(item.id, true).await);
    }
    assert!(matches!(
        last,
        Some(Err(MeshError::DeadLettered { attempts: 3, .. }))
    ));
    let dead = queue.dead_letters(&cap("analysis")).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, doomed);
}

struct MeshFixture {
    mesh: EventMesh,
    planner: SigningIdentity,
}

fn mesh_fixture() -> MeshFixture {
    let store = shared_store();
    let codec = Arc::new(codec(&store));
    let trust = Arc::new(TrustStore::new());
    let planner = SigningIdentity::generate("planner");
    trust.trust_identity(&planner);
    let registry = AgentRegistry::new(Arc::clone(&store), Duration::from_secs(60));
    let mesh = EventMesh::new(store, registry, codec, trust, EventMeshConfig::default());
    MeshFixture { mesh, planner }
}

async fn received(sub: &mut agentmesh_kernel::Subscription) -> Vec<Event> {
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut events = Vec::new();
    while let Some(event) = sub.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn mesh_fans_out_one_copy_per_matching_subscriber() {
    let fx = mesh_fixture();
    let mut a = fx.mesh.subscribe(&agent("a"), &[cap("analysis")]).await.unwrap();
    let mut b = fx.mesh.subscribe(&agent("b"), &[cap("analysis")]).await.unwrap();
    let mut c = fx.mesh.subscribe(&agent("c"), &[cap("report")]).await.unwrap();

    let id = fx
        .mesh
        .publish(
            &fx.planner,
            &cap("analysis"),
            json!({"finding": "ssh exposed"}),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    for sub in [&mut a, &mut b] {
        let events = received(sub).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, id);
    }
    assert!(received(&mut c).await.is_empty());
}

#[tokio::test]
async fn signed_recon_event_is_verified_once_then_replayed() {
    let fx = mesh_fixture();
    let mut scanner = fx.mesh.subscribe(&agent("scanner"), &[cap("recon")]).await.unwrap();

    fx.mesh
        .publish(
            &fx.planner,
            &cap("recon"),
            json!({"target": "10.0.0.5"}),
            PublishOptions::signed(),
        )
        .await
        .unwrap();

    let events = received(&mut scanner).await;
    assert_eq!(events.len(), 1);
    let event = &events[0];
    let envelope = event.envelope.as_ref().unwrap();
    assert_eq!(envelope.signer_id, "planner");

    let again = fx
        .mesh
        .codec()
        .verify_trusted(envelope, &event.signing_payload(), fx.mesh.trust(), "scanner")
        .await;
    assert_eq!(again, Verification::Rejected(RejectReason::Replayed));
}

#[tokio::test]
async fn kernel_boot_fails_on_unreachable_store() {
    let store = InMemoryStore::new();
    store.set_reachable(false);
    assert!(MeshKernel::boot(MeshConfig::default(), Arc::new(store))
        .await
        .is_err());
}
