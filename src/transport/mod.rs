//! The two listeners. Both hand accepted connections to the same
//! line-oriented connection loop; only the peer identity differs.

pub mod tls;
pub mod unix;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use keyward_proto::{ErrorCode, Reply, Request, RpcError, MAX_MESSAGE_BYTES};

use crate::service::{KeyService, Peer};

/// Serve one connection: a request line in, a reply line out, until the
/// peer hangs up. A handler that was already running when the peer
/// disconnected still completes; only its reply is lost.
pub async fn serve_connection<S>(service: Arc<KeyService>, stream: S, peer: Peer)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(peer = %peer.ip, error = %e, "connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = if line.len() > MAX_MESSAGE_BYTES {
            Reply::Err(RpcError::new(
                ErrorCode::BadRequest,
                "request exceeds size limit",
            ))
        } else {
            match serde_json::from_str::<Request>(&line) {
                Ok(request) => service.handle(&peer, request).await,
                Err(e) => Reply::Err(RpcError::new(
                    ErrorCode::BadRequest,
                    format!("malformed request: {e}"),
                )),
            }
        };
        let mut out = match serde_json::to_vec(&reply) {
            Ok(out) => out,
            Err(e) => {
                tracing::error!(peer = %peer.ip, error = %e, "reply serialization failed");
                break;
            }
        };
        out.push(b'\n');
        if let Err(e) = write_half.write_all(&out).await {
            tracing::debug!(peer = %peer.ip, error = %e, "reply write failed, discarding");
            break;
        }
    }
}
