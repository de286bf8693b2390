use thiserror::Error;

/// Errors from the framed transport.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },
}
