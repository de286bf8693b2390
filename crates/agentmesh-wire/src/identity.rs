//! Ed25519 signing identities and the receiver-side trust store.

use agentmesh_types::{MeshError, MeshResult};
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

/// An agent's (or tool host's) private signing key and its public id.
pub struct SigningIdentity {
    signer_id: String,
    key: SigningKey,
}

impl SigningIdentity {
    /// Generate a fresh key pair.
    pub fn generate(signer_id: impl Into<String>) -> Self {
        Self {
            signer_id: signer_id.into(),
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild an identity from a 32-byte secret seed.
    pub fn from_seed(signer_id: impl Into<String>, seed: &[u8; 32]) -> Self {
        Self {
            signer_id: signer_id.into(),
            key: SigningKey::from_bytes(seed),
        }
    }

    /// Rebuild an identity from a hex-encoded 32-byte seed.
    pub fn from_hex_seed(signer_id: impl Into<String>, seed_hex: &str) -> MeshResult<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| MeshError::InvalidInput(format!("invalid key hex: {e}")))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| MeshError::InvalidInput("signing seed must be 32 bytes".into()))?;
        Ok(Self::from_seed(signer_id, &seed))
    }

    /// The signer id carried in envelopes.
    pub fn signer_id(&self) -> &str {
        &self.signer_id
    }

    /// Public half of the key pair.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Hex-encoded public key, for distribution to peers.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().to_bytes())
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Signature {
        self.key.sign(message)
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("signer_id", &self.signer_id)
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Known signers and their public keys.
#[derive(Debug, Default)]
pub struct TrustStore {
    keys: DashMap<String, VerifyingKey>,
}

impl TrustStore {
    /// Create an empty trust store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust `key` for envelopes claiming `signer_id`. Replaces any previous key.
    pub fn trust(&self, signer_id: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(signer_id.into(), key);
    }

    /// Trust a local identity's public key.
    pub fn trust_identity(&self, identity: &SigningIdentity) {
        self.trust(identity.signer_id(), identity.verifying_key());
    }

    /// Trust a hex-encoded public key.
    pub fn trust_hex(&self, signer_id: impl Into<String>, key_hex: &str) -> MeshResult<()> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|e| MeshError::InvalidInput(format!("invalid public key hex: {e}")))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| MeshError::InvalidInput("public key must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| MeshError::InvalidInput(format!("invalid public key: {e}")))?;
        self.trust(signer_id, key);
        Ok(())
    }

    /// Stop trusting a signer.
    pub fn revoke(&self, signer_id: &str) -> bool {
        self.keys.remove(signer_id).is_some()
    }

    /// Public key for a signer, if trusted.
    pub fn get(&self, signer_id: &str) -> Option<VerifyingKey> {
        self.keys.get(signer_id).map(|k| *k.value())
    }

    /// Number of trusted signers.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no signer is trusted.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
