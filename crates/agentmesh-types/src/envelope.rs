//! Signed envelope wire types.
//!
//! An envelope travels alongside a raw payload and proves who produced it and
//! when. Wire format (JSON, keys fixed):
//!
//! ```json
//! {"timestamp": "RFC3339", "nonce": "base64", "payload_hash": "hex-sha256",
//!  "signature": "base64", "signer_id": "string"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signature wrapper over a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Hex-encoded SHA-256 of the canonical payload.
    pub payload_hash: String,
    /// When the envelope was signed.
    pub timestamp: DateTime<Utc>,
    /// Base64 single-use random token (16 bytes).
    pub nonce: String,
    /// Base64 signature bytes.
    pub signature: String,
    /// Identity of the signer, used to look up its public key.
    pub signer_id: String,
}

/// Why an envelope was rejected. Checks run in this order and stop at the
/// first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// The payload does not hash to `payload_hash` (tampered).
    HashMismatch,
    /// The signature does not verify under the signer's key.
    BadSignature,
    /// The timestamp is outside the skew tolerance.
    Expired,
    /// The nonce was already used.
    Replayed,
}

impl RejectReason {
    /// Stable name used in logs and `auth:<reason>` errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HashMismatch => "HashMismatch",
            Self::BadSignature => "BadSignature",
            Self::Expired => "Expired",
            Self::Replayed => "Replayed",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of verifying an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// All checks passed and the nonce is now consumed.
    Accepted,
    /// A check failed.
    Rejected(RejectReason),
}

impl Verification {
    /// Whether the envelope was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// The rejection reason, if any.
    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Self::Accepted => None,
            Self::Rejected(r) => Some(*r),
        }
    }

    /// Convert into a result, mapping rejections to `MeshError::Rejected`.
    pub fn into_result(self) -> crate::error::MeshResult<()> {
        match self {
            Self::Accepted => Ok(()),
            Self::Rejected(r) => Err(crate::error::MeshError::Rejected(r)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_keys() {
        let env = Envelope {
            payload_hash: "ab".repeat(32),
            timestamp: Utc::now(),
            nonce: "bm9uY2U=".into(),
            signature: "c2ln".into(),
            signer_id: "agent-1".into(),
        };
        let json = serde_json::to_value(&env).unwrap();
        let obj = json.as_object().unwrap();
        for key in ["timestamp", "nonce", "payload_hash", "signature", "signer_id"] {
            assert!(obj.contains_key(key), "missing key {key}");
        }
        assert_eq!(obj.len(), 5);
        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_verification_helpers() {
        assert!(Verification::Accepted.is_accepted());
        let rejected = Verification::Rejected(RejectReason::Expired);
        assert_eq!(rejected.reason(), Some(RejectReason::Expired));
        assert!(rejected.into_result().is_err());
    }
}
