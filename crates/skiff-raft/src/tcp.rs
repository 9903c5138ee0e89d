//! TCP transport: length-prefixed bincode frames over plain sockets.
//!
//! Wire format, both directions: a `u32` big-endian length followed by
//! that many bytes of bincode. One request per round trip; the client
//! side opens a fresh connection per RPC, the server side serves as
//! many requests as the peer cares to pipeline on one connection.
//!
//! Raft tolerates lost and duplicated messages by design, so there is
//! no retry or acknowledgment layer here: a broken connection is
//! reported as an error and the consensus core retries on its own
//! schedule.

use crate::cluster::ClusterConfig;
use crate::error::{RaftError, Result};
use crate::transport::{RaftTransport, RpcMessage, RpcSender};
use crate::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Upper bound on a frame, to keep a garbage length prefix from
/// allocating gigabytes.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
enum WireRequest {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
}

#[derive(Debug, Serialize, Deserialize)]
enum WireResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
}

/// Outbound half: resolves ReplicaIds through the cluster config and
/// dials peers per request.
pub struct TcpTransport {
    cluster: ClusterConfig,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(cluster: ClusterConfig) -> Self {
        Self {
            cluster,
            connect_timeout: Duration::from_millis(500),
        }
    }

    async fn call(&self, target: ReplicaId, request: WireRequest) -> Result<WireResponse> {
        let addr = self.cluster.addr(target).ok_or_else(|| RaftError::Config {
            reason: format!("no address for replica {}", target),
        })?;

        let mut stream =
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    RaftError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("connect to {} timed out", target),
                    ))
                })??;

        write_frame(&mut stream, &request).await?;
        read_frame(&mut stream).await
    }
}

#[async_trait]
impl RaftTransport for TcpTransport {
    async fn request_vote(
        &self,
        target: ReplicaId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        match self.call(target, WireRequest::RequestVote(request)).await? {
            WireResponse::RequestVote(response) => Ok(response),
            WireResponse::AppendEntries(_) => Err(RaftError::Internal {
                reason: "mismatched response type for RequestVote".to_string(),
            }),
        }
    }

    async fn append_entries(
        &self,
        target: ReplicaId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        match self
            .call(target, WireRequest::AppendEntries(request))
            .await?
        {
            WireResponse::AppendEntries(response) => Ok(response),
            WireResponse::RequestVote(_) => Err(RaftError::Internal {
                reason: "mismatched response type for AppendEntries".to_string(),
            }),
        }
    }
}

/// Inbound half: accept connections and feed decoded requests into the
/// RPC handler channel. Runs until shutdown.
pub async fn serve(
    listener: TcpListener,
    rpc_tx: RpcSender,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let rpc_tx = rpc_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, rpc_tx).await {
                                tracing::debug!(peer = %peer_addr, error = ?e, "connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = ?e, "accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("TCP transport shutting down");
                break;
            }
        }
    }
}

/// Serve requests on one connection until the peer hangs up.
async fn handle_connection(mut stream: TcpStream, rpc_tx: RpcSender) -> Result<()> {
    loop {
        let request: WireRequest = match read_frame(&mut stream).await {
            Ok(request) => request,
            // Clean EOF between frames is a normal hangup.
            Err(RaftError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(e) => return Err(e),
        };

        let response = match request {
            WireRequest::RequestVote(request) => {
                let (response_tx, response_rx) = tokio::sync::oneshot::channel();
                rpc_tx
                    .send(RpcMessage::RequestVote {
                        request,
                        response_tx,
                    })
                    .await
                    .map_err(|_| RaftError::Internal {
                        reason: "RPC handler gone".to_string(),
                    })?;
                WireResponse::RequestVote(response_rx.await.map_err(|_| {
                    RaftError::Internal {
                        reason: "RPC handler dropped the response".to_string(),
                    }
                })?)
            }
            WireRequest::AppendEntries(request) => {
                let (response_tx, response_rx) = tokio::sync::oneshot::channel();
                rpc_tx
                    .send(RpcMessage::AppendEntries {
                        request,
                        response_tx,
                    })
                    .await
                    .map_err(|_| RaftError::Internal {
                        reason: "RPC handler gone".to_string(),
                    })?;
                WireResponse::AppendEntries(response_rx.await.map_err(|_| {
                    RaftError::Internal {
                        reason: "RPC handler dropped the response".to_string(),
                    }
                })?)
            }
        };

        write_frame(&mut stream, &response).await?;
    }
}

async fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<()> {
    let payload = bincode::serialize(value)?;
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut TcpStream) -> Result<T> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_BYTES {
        return Err(RaftError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        )));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(bincode::deserialize(&payload)?)
}
