//! Signed remote tool invocation.
//!
//! The caller signs `{tool_name, arguments}` with its own key. The host
//! verifies the envelope before touching the tool; a failed check yields
//! `{success: false, error: "auth:<reason>"}` and the tool never runs. Every
//! result, denials included, is signed by the host so the caller can tell a
//! genuine denial from a forged one. The signed result carries the request's
//! nonce, and the caller checks it against the request it sent.

use crate::envelope::EnvelopeCodec;
use crate::error::WireError;
use crate::identity::{SigningIdentity, TrustStore};
use crate::message::{WireMessage, WireMessageKind};
use crate::transport::{read_message, write_message};
use agentmesh_types::{RejectReason, ToolCallRequest, ToolCallResult, Verification};
use async_trait::async_trait;
use dashmap::DashMap;
use ed25519_dalek::VerifyingKey;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Default round-trip timeout for [`ToolClient::invoke`].
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A tool hosted by a [`ToolServer`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name callers use to address the tool.
    fn name(&self) -> &str;

    /// Run the tool. `Err` is reported to the caller as a failed result.
    async fn execute(&self, arguments: &serde_json::Value) -> Result<serde_json::Value, String>;
}

/// Caller side: builds signed requests and checks signed results.
#[derive(Debug, Clone)]
pub struct ToolClient {
    identity: Arc<SigningIdentity>,
    codec: Arc<EnvelopeCodec>,
    call_timeout: Duration,
}

impl ToolClient {
    pub fn new(identity: Arc<SigningIdentity>, codec: Arc<EnvelopeCodec>) -> Self {
        Self {
            identity,
            codec,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the network round-trip timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Build a signed request.
    pub fn call(&self, tool_name: &str, arguments: serde_json::Value) -> ToolCallRequest {
        let payload = ToolCallRequest::signed_payload(tool_name, &arguments);
        let envelope = self.codec.sign(&payload, &self.identity);
        ToolCallRequest {
            tool_name: tool_name.to_string(),
            arguments,
            envelope,
        }
    }

    /// Check the host's signature on the result of `request`. Unsigned
    /// results, and results signed in reply to another request, are rejected.
    pub async fn verify_result(
        &self,
        request: &ToolCallRequest,
        result: &ToolCallResult,
        server_key: &VerifyingKey,
    ) -> Verification {
        let Some(envelope) = &result.envelope else {
            warn!(target: "security", tool = %result.tool_name, "Unsigned tool result");
            return Verification::Rejected(RejectReason::BadSignature);
        };
        if result.in_reply_to != request.envelope.nonce {
            warn!(
                target: "security",
                tool = %result.tool_name,
                "Tool result answers a different request"
            );
        }
        self.codec
            .verify_scoped(
                envelope,
                &result.payload_replying_to(&request.envelope.nonce),
                server_key,
                self.identity.signer_id(),
            )
            .await
    }

    /// Send a request to a tool host and wait for its result.
    pub async fn invoke(
        &self,
        addr: SocketAddr,
        request: ToolCallRequest,
    ) -> Result<ToolCallResult, WireError> {
        let tool_name = request.tool_name.clone();
        match tokio::time::timeout(self.call_timeout, self.round_trip(addr, request)).await {
            Ok(result) => result,
            Err(_) => Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("tool call '{tool_name}' to {addr} timed out"),
            ))),
        }
    }

    async fn round_trip(
        &self,
        addr: SocketAddr,
        request: ToolCallRequest,
    ) -> Result<ToolCallResult, WireError> {
        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = stream.into_split();

        let call = WireMessage::tool_call(request);
        write_message(&mut writer, &call).await?;
        let reply = read_message(&mut reader).await?;

        if reply.id != call.id {
            return Err(WireError::UnexpectedMessage(format!(
                "reply id {} does not match call id {}",
                reply.id, call.id
            )));
        }
        match reply.kind {
            WireMessageKind::ToolResult(result) => Ok(result),
            WireMessageKind::Error { code, message } => Err(WireError::Remote { code, message }),
            WireMessageKind::ToolCall(_) => Err(WireError::UnexpectedMessage(
                "tool_call sent in reply".to_string(),
            )),
        }
    }
}

/// Host side: verifies requests, runs registered tools, signs results.
pub struct ToolServer {
    identity: Arc<SigningIdentity>,
    codec: Arc<EnvelopeCodec>,
    trust: Arc<TrustStore>,
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl ToolServer {
    pub fn new(
        identity: Arc<SigningIdentity>,
        codec: Arc<EnvelopeCodec>,
        trust: Arc<TrustStore>,
    ) -> Self {
        Self {
            identity,
            codec,
            trust,
            tools: DashMap::new(),
        }
    }

    /// Host a tool. Replaces any tool with the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        info!(tool = %name, host = %self.identity.signer_id(), "Tool registered");
        self.tools.insert(name, tool);
    }

    /// Names of hosted tools, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// The host's signing identity.
    pub fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    /// Verify, execute and sign.
    pub async fn handle(&self, request: &ToolCallRequest) -> ToolCallResult {
        let verdict = self
            .codec
            .verify_trusted(
                &request.envelope,
                &request.payload(),
                &self.trust,
                self.identity.signer_id(),
            )
            .await;

        let result = match verdict {
            Verification::Rejected(reason) => {
                warn!(
                    target: "security",
                    tool = %request.tool_name,
                    caller = %request.envelope.signer_id,
                    reason = %reason,
                    "Tool call denied"
                );
                ToolCallResult::denied(&request.tool_name, reason)
            }
            Verification::Accepted => self.execute(request).await,
        };
        self.sign_result(request, result)
    }

    async fn execute(&self, request: &ToolCallRequest) -> ToolCallResult {
        let tool = self
            .tools
            .get(&request.tool_name)
            .map(|entry| Arc::clone(entry.value()));
        let Some(tool) = tool else {
            debug!(tool = %request.tool_name, "Unknown tool requested");
            return ToolCallResult::failed(
                &request.tool_name,
                format!("unknown tool: {}", request.tool_name),
                0,
            );
        };

        let started = Instant::now();
        let outcome = tool.execute(&request.arguments).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            tool = %request.tool_name,
            caller = %request.envelope.signer_id,
            elapsed_ms,
            ok = outcome.is_ok(),
            "Tool executed"
        );
        match outcome {
            Ok(data) => ToolCallResult::ok(&request.tool_name, data, elapsed_ms),
            Err(error) => ToolCallResult::failed(&request.tool_name, error, elapsed_ms),
        }
    }

    fn sign_result(&self, request: &ToolCallRequest, mut result: ToolCallResult) -> ToolCallResult {
        result.in_reply_to = request.envelope.nonce.clone();
        result.envelope = Some(self.codec.sign(&result.payload(), &self.identity));
        result
    }
}

impl std::fmt::Debug for ToolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolServer")
            .field("host", &self.identity.signer_id())
            .field("tools", &self.tool_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce::NonceStore;
    use agentmesh_store::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTool {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, arguments: &serde_json::Value) -> Result<serde_json::Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match arguments.get("fail") {
                Some(_) => Err("asked to fail".to_string()),
                None => Ok(json!({"echo": arguments})),
            }
        }
    }

    struct Fixture {
        client: ToolClient,
        server: ToolServer,
        tool: Arc<EchoTool>,
        server_key: VerifyingKey,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let nonces = Arc::new(NonceStore::new(
            Arc::new(store),
            Duration::from_secs(300),
            1024,
        ));
        let codec = Arc::new(EnvelopeCodec::new(nonces, Duration::from_secs(60)));

        let client_identity = Arc::new(SigningIdentity::generate("planner"));
        let server_identity = Arc::new(SigningIdentity::generate("toolhost"));
        let trust = Arc::new(TrustStore::new());
        trust.trust_identity(&client_identity);

        let server = ToolServer::new(Arc::clone(&server_identity), Arc::clone(&codec), trust);
        let tool = Arc::new(EchoTool {
            calls: AtomicUsize::new(0),
        });
        server.register(tool.clone());

        Fixture {
            client: ToolClient::new(client_identity, codec),
            server,
            tool,
            server_key: server_identity.verifying_key(),
        }
    }

    #[tokio::test]
    async fn test_call_executes_and_signs() {
        let fx = fixture();
        let request = fx.client.call("echo", json!({"msg": "hi"}));
        let result = fx.server.handle(&request).await;

        assert!(result.success);
        assert_eq!(result.data.as_ref().unwrap()["echo"]["msg"], "hi");
        assert_eq!(result.tool_name, "echo");
        assert!(result.envelope.is_some());
        assert_eq!(result.in_reply_to, request.envelope.nonce);
        assert!(fx
            .client
            .verify_result(&request, &result, &fx.server_key)
            .await
            .is_accepted());
    }

    #[tokio::test]
    async fn test_replayed_request_is_denied_without_executing() {
        let fx = fixture();
        let request = fx.client.call("echo", json!({"msg": "hi"}));
        assert!(fx.server.handle(&request).await.success);

        let replay = fx.server.handle(&request).await;
        assert!(!replay.success);
        assert_eq!(replay.error.as_deref(), Some("auth:Replayed"));
        assert_eq!(fx.tool.calls.load(Ordering::SeqCst), 1);
        // Denials are signed too.
        assert!(fx
            .client
            .verify_result(&request, &replay, &fx.server_key)
            .await
            .is_accepted());
    }

    #[tokio::test]
    async fn test_tampered_arguments_denied() {
        let fx = fixture();
        let mut request = fx.client.call("echo", json!({"msg": "hi"}));
        request.arguments = json!({"msg": "rm -rf"});

        let result = fx.server.handle(&request).await;
        assert_eq!(result.error.as_deref(), Some("auth:HashMismatch"));
        assert_eq!(fx.tool.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_untrusted_caller_denied() {
        let fx = fixture();
        let stranger = ToolClient::new(
            Arc::new(SigningIdentity::generate("stranger")),
            Arc::clone(&fx.client.codec),
        );
        let result = fx.server.handle(&stranger.call("echo", json!({}))).await;
        assert_eq!(result.error.as_deref(), Some("auth:BadSignature"));
    }

    #[tokio::test]
    async fn test_tool_failure_and_unknown_tool() {
        let fx = fixture();
        let failed = fx.server.handle(&fx.client.call("echo", json!({"fail": true}))).await;
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("asked to fail"));

        let unknown = fx.server.handle(&fx.client.call("nmap", json!({}))).await;
        assert!(!unknown.success);
        assert_eq!(unknown.error.as_deref(), Some("unknown tool: nmap"));
    }

    #[tokio::test]
    async fn test_forged_result_rejected() {
        let fx = fixture();
        let request = fx.client.call("echo", json!({"n": 1}));
        let mut result = fx.server.handle(&request).await;
        result.data = Some(json!({"echo": {"n": 2}}));
        assert_eq!(
            fx.client.verify_result(&request, &result, &fx.server_key).await,
            Verification::Rejected(RejectReason::HashMismatch)
        );

        let unsigned = ToolCallResult::ok("echo", json!({}), 1);
        assert_eq!(
            fx.client.verify_result(&request, &unsigned, &fx.server_key).await,
            Verification::Rejected(RejectReason::BadSignature)
        );
    }

    #[tokio::test]
    async fn test_result_for_another_request_rejected() {
        let fx = fixture();
        let harmless = fx.client.call("echo", json!({"target": "10.0.0.5"}));
        let harmless_result = fx.server.handle(&harmless).await;
        let pending = fx.client.call("echo", json!({"target": "10.0.0.9"}));

        // A genuine, host-signed result handed back as the answer to `pending`.
        assert_eq!(
            fx.client
                .verify_result(&pending, &harmless_result, &fx.server_key)
                .await,
            Verification::Rejected(RejectReason::HashMismatch)
        );

        // Rewriting the reply nonce breaks the signature all the same.
        let mut relabelled = harmless_result.clone();
        relabelled.in_reply_to = pending.envelope.nonce.clone();
        assert_eq!(
            fx.client
                .verify_result(&pending, &relabelled, &fx.server_key)
                .await,
            Verification::Rejected(RejectReason::HashMismatch)
        );

        assert!(fx
            .client
            .verify_result(&harmless, &harmless_result, &fx.server_key)
            .await
            .is_accepted());
    }

    #[test]
    fn test_tool_names_sorted() {
        let fx = fixture();
        assert_eq!(fx.server.tool_names(), vec!["echo".to_string()]);
    }
}
