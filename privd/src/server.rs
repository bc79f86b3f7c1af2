use std::sync::Arc;
use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use shared::protocol::{Request, Response};
use crate::lifecycle::LifecycleManager;
use crate::peers::{PeerId, PeerTracker};

/// Accept callers until cancelled. Each connection is served on its own
/// task; calls from different connections may arrive concurrently.
pub async fn serve(
    listener: UnixListener,
    manager: Arc<LifecycleManager>,
    peers: Arc<PeerTracker>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let peer = peers.connected();
                        tracing::debug!("Accepted {}", peer);
                        tokio::spawn(handle_connection(stream, peer, manager.clone(), peers.clone()));
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {}", e);
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("Endpoint server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    peer: PeerId,
    manager: Arc<LifecycleManager>,
    peers: Arc<PeerTracker>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Read from {} failed: {}", peer, e);
                break;
            }
        };

        let response = dispatch(&manager, peer, &line).await;
        let mut reply = match serde_json::to_string(&response) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("Failed to encode response: {}", e);
                break;
            }
        };
        reply.push('\n');

        if let Err(e) = writer.write_all(reply.as_bytes()).await {
            tracing::debug!("Write to {} failed: {}", peer, e);
            break;
        }
    }

    tracing::debug!("{} disconnected", peer);
    peers.disconnected(peer);
}

async fn dispatch(manager: &LifecycleManager, peer: PeerId, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Malformed request from {}: {}", peer, e);
            return Response::Error {
                message: format!("malformed request: {}", e),
            };
        }
    };

    let result = match request {
        Request::Bind(bind) => manager
            .bind(peer, bind)
            .await
            .map(|handle| Response::Bound { handle }),
        Request::Unbind => manager
            .unbind(peer)
            .await
            .map(|outcome| Response::Unbound { outcome }),
        Request::Stop => manager.stop().await.map(|()| Response::Ok),
        Request::Broadcast => {
            manager.broadcast();
            Ok(Response::Ok)
        }
    };

    result.unwrap_or_else(|e| Response::Error {
        message: format!("{:#}", e),
    })
}
