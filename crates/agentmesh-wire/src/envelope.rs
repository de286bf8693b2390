//! Envelope signing and verification.
//!
//! Sender side: canonicalize the payload, hash it, stamp the current time and a
//! fresh 128-bit nonce, and sign. Receiver side, terminal on the first failure:
//!
//! 1. recompute the payload hash (`HashMismatch`); a tampered payload makes
//!    the signature check moot,
//! 2. check the Ed25519 signature (`BadSignature`),
//! 3. check `|now - timestamp| <= skew_tolerance` (`Expired`),
//! 4. atomically consume the nonce (`Replayed`).
//!
//! Rejections are logged on the `security` target and returned as values, never
//! as errors carrying internal detail.

use crate::canonical::{canonicalize, payload_hash};
use crate::identity::{SigningIdentity, TrustStore};
use crate::nonce::NonceStore;
use agentmesh_types::config::EnvelopeConfig;
use agentmesh_types::{Envelope, RejectReason, Verification};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// Nonce bytes per envelope (128 bits).
const NONCE_LEN: usize = 16;

/// Nonce scope used when the caller does not supply one.
const GLOBAL_SCOPE: &str = "";

/// A payload travelling with its envelope (inter-agent messaging).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedMessage {
    /// Signature over `payload`.
    pub envelope: Envelope,
    /// The raw payload.
    pub payload: serde_json::Value,
}

/// Signs and verifies envelopes. Owns its nonce store.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    nonces: Arc<NonceStore>,
    skew_tolerance: Duration,
}

impl EnvelopeCodec {
    /// Create a codec that accepts timestamps within `skew_tolerance` of now.
    pub fn new(nonces: Arc<NonceStore>, skew_tolerance: Duration) -> Self {
        Self {
            nonces,
            skew_tolerance,
        }
    }

    /// Create a codec from the `[envelope]` config section.
    pub fn from_config(nonces: Arc<NonceStore>, config: &EnvelopeConfig) -> Self {
        Self::new(nonces, config.skew_tolerance())
    }

    /// Accepted clock skew.
    pub fn skew_tolerance(&self) -> Duration {
        self.skew_tolerance
    }

    /// The nonce store backing replay checks.
    pub fn nonces(&self) -> &Arc<NonceStore> {
        &self.nonces
    }

    /// Sign `payload` as `identity`, stamped with the current time.
    pub fn sign(&self, payload: &serde_json::Value, identity: &SigningIdentity) -> Envelope {
        self.sign_at(payload, identity, Utc::now())
    }

    /// Sign `payload` with an explicit timestamp.
    pub fn sign_at(
        &self,
        payload: &serde_json::Value,
        identity: &SigningIdentity,
        timestamp: DateTime<Utc>,
    ) -> Envelope {
        let timestamp = timestamp.trunc_subsecs(3);
        let payload_hash = payload_hash(payload);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = BASE64.encode(nonce_bytes);

        let input = signing_input(&timestamp, &payload_hash, &nonce, identity.signer_id());
        let signature = identity.sign(input.as_bytes());

        Envelope {
            payload_hash,
            timestamp,
            nonce,
            signature: BASE64.encode(signature.to_bytes()),
            signer_id: identity.signer_id().to_string(),
        }
    }

    /// Wrap a payload for transmission.
    pub fn seal(&self, payload: serde_json::Value, identity: &SigningIdentity) -> SignedMessage {
        let envelope = self.sign(&payload, identity);
        SignedMessage { envelope, payload }
    }

    /// Verify a received message against the trust store.
    pub async fn open(&self, message: &SignedMessage, trust: &TrustStore, scope: &str) -> Verification {
        self.verify_trusted(&message.envelope, &message.payload, trust, scope)
            .await
    }

    /// Verify `envelope` over `payload` under `public_key`.
    pub async fn verify(
        &self,
        envelope: &Envelope,
        payload: &serde_json::Value,
        public_key: &VerifyingKey,
    ) -> Verification {
        self.verify_scoped(envelope, payload, public_key, GLOBAL_SCOPE)
            .await
    }

    /// Verify with nonces tracked per `scope` (typically the receiving agent),
    /// so one envelope fanned out to several receivers is accepted once by each.
    pub async fn verify_scoped(
        &self,
        envelope: &Envelope,
        payload: &serde_json::Value,
        public_key: &VerifyingKey,
        scope: &str,
    ) -> Verification {
        self.verify_at(envelope, payload, public_key, scope, Utc::now())
            .await
    }

    /// Verify, resolving the signer's key from `trust`. Unknown signers are
    /// rejected as `BadSignature`.
    pub async fn verify_trusted(
        &self,
        envelope: &Envelope,
        payload: &serde_json::Value,
        trust: &TrustStore,
        scope: &str,
    ) -> Verification {
        match trust.get(&envelope.signer_id) {
            Some(key) => self.verify_scoped(envelope, payload, &key, scope).await,
            None => reject(envelope, RejectReason::BadSignature, "unknown signer"),
        }
    }

    /// Verify against an explicit clock reading.
    pub async fn verify_at(
        &self,
        envelope: &Envelope,
        payload: &serde_json::Value,
        public_key: &VerifyingKey,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Verification {
        let recomputed = payload_hash(payload);
        if !bool::from(recomputed.as_bytes().ct_eq(envelope.payload_hash.as_bytes())) {
            return reject(envelope, RejectReason::HashMismatch, "payload hash mismatch");
        }

        if !signature_valid(envelope, public_key) {
            return reject(envelope, RejectReason::BadSignature, "signature check failed");
        }

        let drift_ms = (now - envelope.timestamp).num_milliseconds().unsigned_abs();
        if u128::from(drift_ms) > self.skew_tolerance.as_millis() {
            return reject(envelope, RejectReason::Expired, "timestamp outside skew tolerance");
        }

        if !self.nonces.check_and_insert(scope, &envelope.nonce).await {
            return reject(envelope, RejectReason::Replayed, "nonce already used");
        }

        debug!(signer = %envelope.signer_id, scope, "Envelope accepted");
        Verification::Accepted
    }
}

fn signature_valid(envelope: &Envelope, public_key: &VerifyingKey) -> bool {
    let Ok(bytes) = BASE64.decode(&envelope.signature) else {
        return false;
    };
    let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&bytes);
    let input = signing_input(
        &envelope.timestamp,
        &envelope.payload_hash,
        &envelope.nonce,
        &envelope.signer_id,
    );
    public_key.verify(input.as_bytes(), &signature).is_ok()
}

/// Bytes covered by the signature: `(timestamp, payload_hash)` bound to the
/// nonce and signer id so neither can be swapped on a captured envelope.
fn signing_input(
    timestamp: &DateTime<Utc>,
    payload_hash: &str,
    nonce: &str,
    signer_id: &str,
) -> String {
    canonicalize(&json!({
        "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        "payload_hash": payload_hash,
        "nonce": nonce,
        "signer_id": signer_id,
    }))
}

fn reject(envelope: &Envelope, reason: RejectReason, detail: &str) -> Verification {
    warn!(
        target: "security",
        signer = %envelope.signer_id,
        reason = %reason,
        detail,
        "Envelope rejected"
    );
    Verification::Rejected(reason)
}
