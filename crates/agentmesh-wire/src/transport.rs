//! Length-prefixed JSON framing over TCP and the tool host accept loop.

use crate::error::WireError;
use crate::message::{decode_length, decode_message, encode_message, WireMessage, WireMessageKind};
use crate::tool::ToolServer;
use agentmesh_store::CancelSignal;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Maximum frame body size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Write a framed message (4-byte length + JSON).
pub async fn write_message<W>(writer: &mut W, msg: &WireMessage) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(msg)?;
    if bytes.len() - 4 > MAX_MESSAGE_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: (bytes.len() - 4) as u32,
            max: MAX_MESSAGE_SIZE,
        });
    }
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message (4-byte length + JSON).
pub async fn read_message<R>(reader: &mut R) -> Result<WireMessage, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    // Grow with the bytes that actually arrive; the header alone does not
    // get to reserve the full frame.
    let mut body = Vec::new();
    (&mut *reader).take(u64::from(len)).read_to_end(&mut body).await?;
    if body.len() < len as usize {
        return Err(WireError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("frame body truncated: {} of {len} bytes", body.len()),
        )));
    }

    let msg = decode_message(&body)?;
    Ok(msg)
}

/// Accept tool calls on `listener` until `cancel` fires. Each connection runs
/// on its own task and may carry any number of calls.
pub async fn serve_tools(listener: TcpListener, server: Arc<ToolServer>, cancel: CancelSignal) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, host = %server.identity().signer_id(), "Tool host listening");
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Tool host stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "Tool host accepted connection");
                    let server = Arc::clone(&server);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            outcome = connection_loop(stream, addr, &server) => {
                                if let Err(e) = outcome {
                                    debug!(%addr, error = %e, "Tool connection ended");
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Tool host accept error");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
}

async fn connection_loop(
    stream: TcpStream,
    addr: SocketAddr,
    server: &ToolServer,
) -> Result<(), WireError> {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let msg = match read_message(&mut reader).await {
            Ok(m) => m,
            Err(WireError::ConnectionClosed) => return Ok(()),
            Err(WireError::Json(e)) => {
                warn!(%addr, error = %e, "Malformed tool frame");
                let reply = WireMessage {
                    id: String::new(),
                    kind: WireMessageKind::Error {
                        code: 400,
                        message: "malformed frame".to_string(),
                    },
                };
                write_message(&mut writer, &reply).await?;
                continue;
            }
            Err(e) => return Err(e),
        };

        let kind = match &msg.kind {
            WireMessageKind::ToolCall(request) => {
                WireMessageKind::ToolResult(server.handle(request).await)
            }
            _ => WireMessageKind::Error {
                code: 400,
                message: "expected tool_call".to_string(),
            },
        };
        write_message(&mut writer, &WireMessage { id: msg.id, kind }).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeCodec;
    use crate::identity::{SigningIdentity, TrustStore};
    use crate::nonce::NonceStore;
    use crate::tool::{Tool, ToolClient};
    use agentmesh_store::{cancel_pair, InMemoryStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct UpperTool;

    #[async_trait]
    impl Tool for UpperTool {
        fn name(&self) -> &str {
            "upper"
        }

        async fn execute(&self, arguments: &serde_json::Value) -> Result<serde_json::Value, String> {
            let text = arguments["text"].as_str().ok_or("missing text")?;
            Ok(json!(text.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = WireMessage {
            id: "m-1".to_string(),
            kind: WireMessageKind::Error {
                code: 1,
                message: "x".to_string(),
            },
        };
        write_message(&mut a, &msg).await.unwrap();
        let read = read_message(&mut b).await.unwrap();
        assert_eq!(read.id, "m-1");

        drop(a);
        assert!(matches!(
            read_message(&mut b).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            read_message(&mut b).await,
            Err(WireError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_body_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&MAX_MESSAGE_SIZE.to_be_bytes()).await.unwrap();
        a.write_all(br#"{"id":"m-1""#).await.unwrap();
        drop(a);

        match read_message(&mut b).await {
            Err(WireError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected truncated frame error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_over_tcp() {
        let nonces = Arc::new(NonceStore::new(
            Arc::new(InMemoryStore::new()),
            Duration::from_secs(300),
            1024,
        ));
        let codec = Arc::new(EnvelopeCodec::new(nonces, Duration::from_secs(60)));
        let caller = Arc::new(SigningIdentity::generate("caller"));
        let host = Arc::new(SigningIdentity::generate("host"));
        let trust = Arc::new(TrustStore::new());
        trust.trust_identity(&caller);

        let server = Arc::new(ToolServer::new(host.clone(), codec.clone(), trust));
        server.register(Arc::new(UpperTool));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (handle, cancel) = cancel_pair();
        let task = tokio::spawn(serve_tools(listener, server, cancel));

        let client = ToolClient::new(caller, codec);
        let request = client.call("upper", json!({"text": "mesh"}));
        let result = client.invoke(addr, request.clone()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.data, Some(json!("MESH")));
        assert!(client
            .verify_result(&request, &result, &host.verifying_key())
            .await
            .is_accepted());

        let replay = client.invoke(addr, request).await.unwrap();
        assert_eq!(replay.error.as_deref(), Some("auth:Replayed"));

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
