//! JSON-lines transport over TCP.
//!
//! Every message is one JSON document followed by `\n`. A connection to a
//! member starts with a [`MemberRequest`]: `subscribe` turns the connection
//! into a stream of full [`ClusterFacts`] publications, `request` expects
//! one [`MemberResponse`] per request line. The tribe node's own listener
//! takes one [`Operation`] per line and answers with the owner's response or
//! a rejection body.

use crate::coordinator::TribeNode;
use crate::error::{Result, TribeError};
use crate::link::{ClusterConnector, StateSource};
use crate::router::{error_body, Operation, RemoteClient};
use crate::sim::SimCluster;
use crate::state::ClusterFacts;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// First message on a connection to a member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemberRequest {
    /// Stream state publications.
    Subscribe,
    /// Execute one operation.
    Request {
        /// The operation.
        op: Operation,
    },
}

/// Member answer to a [`MemberRequest::Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberResponse {
    /// The member's response body.
    Ok(Value),
    /// The member rejected the request.
    Error {
        /// Reason code.
        code: String,
        /// Diagnostic.
        reason: String,
    },
}

/// TCP settings.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Bound on connecting to one seed (ms).
    pub connect_timeout_ms: u64,
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

type LineReader = Lines<BufReader<OwnedReadHalf>>;

async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(message)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Connect to the first reachable seed, in order.
async fn connect_seeds(
    config: &TcpConfig,
    alias: &str,
    seeds: &[String],
) -> Result<(LineReader, OwnedWriteHalf)> {
    let timeout = Duration::from_millis(config.connect_timeout_ms);
    let mut last_error = String::from("no seeds");
    for seed in seeds {
        match tokio::time::timeout(timeout, TcpStream::connect(seed)).await {
            Ok(Ok(stream)) => {
                if config.nodelay {
                    stream.set_nodelay(true)?;
                }
                debug!(alias = %alias, seed = %seed, "TCP connected");
                let (read, write) = stream.into_split();
                return Ok((BufReader::new(read).lines(), write));
            }
            Ok(Err(e)) => last_error = format!("{}: {}", seed, e),
            Err(_) => last_error = format!("{}: timed out", seed),
        }
    }
    Err(TribeError::RemoteUnreachable {
        alias: alias.to_string(),
        msg: last_error,
    })
}

fn connection_closed(alias: &str) -> TribeError {
    TribeError::RemoteUnreachable {
        alias: alias.to_string(),
        msg: "connection closed".to_string(),
    }
}

/// Connector reaching members over TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TcpConfig,
}

impl TcpConnector {
    /// Create a connector.
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClusterConnector for TcpConnector {
    async fn connect(&self, alias: &str, seeds: &[String]) -> Result<Box<dyn StateSource>> {
        let (lines, mut writer) = connect_seeds(&self.config, alias, seeds).await?;
        write_line(&mut writer, &MemberRequest::Subscribe).await?;
        Ok(Box::new(TcpStateSource {
            alias: alias.to_string(),
            lines,
            _writer: writer,
        }))
    }

    fn client(&self, alias: &str, seeds: &[String]) -> Result<Arc<dyn RemoteClient>> {
        Ok(Arc::new(TcpRemoteClient {
            alias: alias.to_string(),
            seeds: seeds.to_vec(),
            config: self.config.clone(),
        }))
    }
}

/// Subscription stream from a member.
pub struct TcpStateSource {
    alias: String,
    lines: LineReader,
    _writer: OwnedWriteHalf,
}

#[async_trait]
impl StateSource for TcpStateSource {
    async fn next_state(&mut self) -> Result<ClusterFacts> {
        let line = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| connection_closed(&self.alias))?;
        Ok(serde_json::from_str(&line)?)
    }
}

/// Request client for a member; one connection per request.
#[derive(Debug, Clone)]
pub struct TcpRemoteClient {
    alias: String,
    seeds: Vec<String>,
    config: TcpConfig,
}

#[async_trait]
impl RemoteClient for TcpRemoteClient {
    async fn forward(&self, op: &Operation) -> Result<Value> {
        let (mut lines, mut writer) = connect_seeds(&self.config, &self.alias, &self.seeds).await?;
        write_line(&mut writer, &MemberRequest::Request { op: op.clone() }).await?;
        let line = lines
            .next_line()
            .await?
            .ok_or_else(|| connection_closed(&self.alias))?;

        Ok(match serde_json::from_str::<MemberResponse>(&line)? {
            MemberResponse::Ok(body) => body,
            MemberResponse::Error { code, reason } => {
                serde_json::json!({"error": {"code": code, "reason": reason}})
            }
        })
    }
}

/// Serve an in-process cluster to TCP clients until `cancel` fires.
pub async fn serve_cluster(
    cluster: SimCluster,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    info!(cluster = %cluster.name(), addr = ?listener.local_addr().ok(), "serving member cluster");
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let cluster = cluster.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = cluster_connection(cluster, stream, cancel).await {
                debug!(peer = %peer, error = %e, "member connection ended");
            }
        });
    }
}

async fn cluster_connection(
    cluster: SimCluster,
    stream: TcpStream,
    cancel: CancellationToken,
) -> Result<()> {
    let (read, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };

        match serde_json::from_str::<MemberRequest>(&line)? {
            MemberRequest::Subscribe => {
                let mut source = cluster.subscribe()?;
                loop {
                    let facts = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        facts = source.next_state() => facts?,
                    };
                    write_line(&mut writer, &facts).await?;
                }
            }
            MemberRequest::Request { op } => {
                let response = match cluster.handle(&op) {
                    Ok(body) => MemberResponse::Ok(body),
                    Err(e) => MemberResponse::Error {
                        code: e.code().to_string(),
                        reason: e.to_string(),
                    },
                };
                write_line(&mut writer, &response).await?;
            }
        }
    }
}

/// Serve tribe node requests until `cancel` fires.
///
/// Each line is an [`Operation`]; each answer is the owning member's
/// response unchanged, or `{"error": {"code", "reason"}}`.
pub async fn serve_requests(
    node: Arc<TribeNode>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "accepting tribe requests");
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let node = Arc::clone(&node);
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = request_connection(node, stream, cancel).await {
                warn!(peer = %peer, error = %e, "request connection failed");
            }
        });
    }
}

async fn request_connection(
    node: Arc<TribeNode>,
    stream: TcpStream,
    cancel: CancellationToken,
) -> Result<()> {
    let (read, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Operation>(&line) {
            Ok(op) => match node.execute(op).await {
                Ok(body) => body,
                Err(e) => error_body(&e),
            },
            Err(e) => error_body(&TribeError::Json(e)),
        };
        write_line(&mut writer, &response).await?;
    }
}
