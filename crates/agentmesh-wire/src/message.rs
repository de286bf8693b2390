//! Tool protocol frames.
//!
//! Tool calls travel as JSON messages over TCP, each prefixed with a 4-byte
//! big-endian length header.

use agentmesh_types::{ToolCallRequest, ToolCallResult};
use serde::{Deserialize, Serialize};

/// A framed protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Correlates a result with its call.
    pub id: String,
    /// Message variant.
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

/// The different kinds of protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessageKind {
    /// Signed request to run a tool.
    #[serde(rename = "tool_call")]
    ToolCall(ToolCallRequest),
    /// Signed result of a tool call.
    #[serde(rename = "tool_result")]
    ToolResult(ToolCallResult),
    /// The frame could not be handled at all.
    #[serde(rename = "error")]
    Error {
        /// Error code.
        code: i32,
        /// Error message.
        message: String,
    },
}

impl WireMessage {
    /// A tool call with a fresh message id.
    pub fn tool_call(request: ToolCallRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: WireMessageKind::ToolCall(request),
        }
    }
}

/// Encode a message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a message.
pub fn decode_message(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}
