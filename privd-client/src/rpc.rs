use std::path::Path;
use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use shared::protocol::{Request, Response, UnbindOutcome};
use shared::types::{BindRequest, Endpoint, ServiceHandle};

/// One connection to a resident endpoint.
///
/// The connection is also the caller's liveness link: while bound, dropping
/// the client (or the process dying) tells the endpoint its client is gone.
pub struct RpcClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RpcClient {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        Self::connect_path(&endpoint.socket).await
    }

    pub async fn connect_path(socket: impl AsRef<Path>) -> Result<Self> {
        let socket = socket.as_ref();
        let stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("Failed to connect to {}", socket.display()))?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    /// Send one request and read its response. `Ok(None)` means the
    /// endpoint closed the connection before answering.
    async fn call(&mut self, request: &Request) -> Result<Option<Response>> {
        let mut line = serde_json::to_string(request).context("Failed to encode request")?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to send request")?;

        let Some(reply) = self.lines.next_line().await.context("Failed to read response")? else {
            return Ok(None);
        };

        let response = serde_json::from_str(&reply)
            .with_context(|| format!("Malformed response: {}", reply))?;
        Ok(Some(response))
    }

    async fn expect(&mut self, request: &Request) -> Result<Response> {
        match self.call(request).await? {
            Some(Response::Error { message }) => anyhow::bail!("endpoint error: {}", message),
            Some(response) => Ok(response),
            None => anyhow::bail!("endpoint closed the connection"),
        }
    }

    pub async fn bind(&mut self, request: BindRequest) -> Result<ServiceHandle> {
        match self.expect(&Request::Bind(request)).await? {
            Response::Bound { handle } => Ok(handle),
            other => anyhow::bail!("unexpected response to bind: {:?}", other),
        }
    }

    pub async fn unbind(&mut self) -> Result<UnbindOutcome> {
        match self.call(&Request::Unbind).await? {
            Some(Response::Unbound { outcome }) => Ok(outcome),
            Some(Response::Error { message }) => anyhow::bail!("endpoint error: {}", message),
            Some(other) => anyhow::bail!("unexpected response to unbind: {:?}", other),
            // The endpoint may exit before the reply is flushed
            None => Ok(UnbindOutcome::Exiting),
        }
    }

    /// Ask the endpoint to shut down. A connection closed mid-call counts
    /// as success since the endpoint exits right after cleanup.
    pub async fn stop(&mut self) -> Result<()> {
        match self.call(&Request::Stop).await? {
            Some(Response::Ok) | None => Ok(()),
            Some(Response::Error { message }) => anyhow::bail!("endpoint error: {}", message),
            Some(other) => anyhow::bail!("unexpected response to stop: {:?}", other),
        }
    }

    /// Ask the endpoint to re-announce itself
    pub async fn broadcast(&mut self) -> Result<()> {
        match self.expect(&Request::Broadcast).await? {
            Response::Ok => Ok(()),
            other => anyhow::bail!("unexpected response to broadcast: {:?}", other),
        }
    }
}
