//! Tool invocation request and result types.

use crate::envelope::{Envelope, RejectReason};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// A signed request to execute a tool on a remote agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Which tool to call.
    pub tool_name: String,
    /// The input parameters.
    pub arguments: serde_json::Value,
    /// Envelope over [`ToolCallRequest::signed_payload`].
    pub envelope: Envelope,
}

impl ToolCallRequest {
    /// The payload covered by the request envelope.
    pub fn signed_payload(tool_name: &str, arguments: &serde_json::Value) -> serde_json::Value {
        json!({
            "tool_name": tool_name,
            "arguments": arguments,
        })
    }

    /// The payload covered by this request's envelope.
    pub fn payload(&self) -> serde_json::Value {
        Self::signed_payload(&self.tool_name, &self.arguments)
    }
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Whether the tool executed successfully.
    pub success: bool,
    /// Output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure. Authentication failures read `auth:<reason>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock execution time.
    pub execution_time_ms: u64,
    /// The tool that was called.
    pub tool_name: String,
    /// Nonce of the request envelope this answers. Empty until the host signs.
    #[serde(default)]
    pub in_reply_to: String,
    /// Server signature over [`ToolCallResult::payload`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
}

impl ToolCallResult {
    /// A successful result.
    pub fn ok(tool_name: impl Into<String>, data: serde_json::Value, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            execution_time_ms,
            tool_name: tool_name.into(),
            in_reply_to: String::new(),
            envelope: None,
        }
    }

    /// A failed result.
    pub fn failed(
        tool_name: impl Into<String>,
        error: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            execution_time_ms,
            tool_name: tool_name.into(),
            in_reply_to: String::new(),
            envelope: None,
        }
    }

    /// A result for a request whose envelope failed verification.
    pub fn denied(tool_name: impl Into<String>, reason: RejectReason) -> Self {
        Self::failed(tool_name, format!("auth:{reason}"), 0)
    }

    /// The payload covered by the result envelope (everything but the envelope).
    pub fn payload(&self) -> serde_json::Value {
        self.payload_replying_to(&self.in_reply_to)
    }

    /// The payload as it would be signed in reply to the request nonce
    /// `request_nonce`. Callers verify against this so a result signed for a
    /// different request fails the hash check.
    pub fn payload_replying_to(&self, request_nonce: &str) -> serde_json::Value {
        json!({
            "success": self.success,
            "data": self.data,
            "error": self.error,
            "execution_time_ms": self.execution_time_ms,
            "tool_name": self.tool_name,
            "in_reply_to": request_nonce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_error_format() {
        let result = ToolCallResult::denied("port_scan", RejectReason::Replayed);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("auth:Replayed"));
        assert!(result.data.is_none());
    }

    #[test]
    fn test_result_payload_excludes_envelope() {
        let result = ToolCallResult::ok("echo", json!({"v": 1}), 12);
        let payload = result.payload();
        assert!(payload.get("envelope").is_none());
        assert_eq!(payload["execution_time_ms"], 12);
        assert_eq!(payload["tool_name"], "echo");
        assert_eq!(payload["in_reply_to"], "");
    }

    #[test]
    fn test_result_payload_binds_request_nonce() {
        let mut result = ToolCallResult::ok("echo", json!({"v": 1}), 12);
        result.in_reply_to = "bm9uY2UtYQ==".to_string();
        assert_eq!(result.payload(), result.payload_replying_to("bm9uY2UtYQ=="));
        assert_ne!(result.payload(), result.payload_replying_to("bm9uY2UtYg=="));
    }

    #[test]
    fn test_result_without_reply_nonce_deserializes() {
        let result: ToolCallResult = serde_json::from_value(json!({
            "success": true,
            "data": 1,
            "execution_time_ms": 3,
            "tool_name": "echo",
        }))
        .unwrap();
        assert!(result.in_reply_to.is_empty());
    }

    #[test]
    fn test_request_payload_shape() {
        let payload = ToolCallRequest::signed_payload("dns_lookup", &json!({"host": "a"}));
        assert_eq!(payload["tool_name"], "dns_lookup");
        assert_eq!(payload["arguments"]["host"], "a");
    }
}
