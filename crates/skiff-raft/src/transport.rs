//! Transport abstraction for Raft RPC communication.
//!
//! Defines the `RaftTransport` trait that allows pluggable transport implementations:
//! - TCP transport for deployments (tcp module)
//! - In-memory channels for unit and cluster tests
//!
//! All RPC calls are async and return `Result<Response, RaftError>`.

use crate::error::Result;
use crate::types::*;
use async_trait::async_trait;

/// Transport abstraction for Raft RPC communication.
///
/// Implementations handle:
/// - Connection management
/// - Serialization/deserialization
/// - Network failures (timeouts, connection errors)
///
/// A transport failure is just an `Err`: the consensus core treats an
/// unreachable peer and a lost response identically and retries on its
/// own schedule. ReplicaId is resolved to an address by the transport.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Send RequestVote RPC to a peer.
    ///
    /// Used during leader election. Candidate sends this to all peers to
    /// request votes. Returns the peer's response (vote granted or denied).
    async fn request_vote(
        &self,
        target: ReplicaId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Send AppendEntries RPC to a peer.
    ///
    /// Used for:
    /// - Heartbeats (empty entries list)
    /// - Log replication (non-empty entries)
    ///
    /// Leader sends this to all followers periodically.
    /// Returns the follower's response (success or conflict info).
    async fn append_entries(
        &self,
        target: ReplicaId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}

/// RPC message envelope (tagged union of all RPC types).
///
/// Inbound side of a transport: whatever receives bytes or channel
/// messages turns them into `RpcMessage`s and the handler loop replies
/// through the oneshot.
#[derive(Debug)]
pub enum RpcMessage {
    RequestVote {
        request: RequestVoteRequest,
        response_tx: tokio::sync::oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        response_tx: tokio::sync::oneshot::Sender<AppendEntriesResponse>,
    },
}

pub type RpcSender = tokio::sync::mpsc::Sender<RpcMessage>;
pub type RpcReceiver = tokio::sync::mpsc::Receiver<RpcMessage>;

/// In-memory transport for testing (local channels, no network).
///
/// Allows testing Raft logic without actual network I/O:
/// - Unit tests (single-threaded, deterministic)
/// - Integration tests (multi-node clusters in-process)
/// - Partition tests (remove_peer simulates a severed link)
pub struct InMemoryTransport {
    peers: std::sync::Arc<parking_lot::RwLock<std::collections::HashMap<ReplicaId, RpcSender>>>,
}

impl InMemoryTransport {
    pub fn new(peers: std::collections::HashMap<ReplicaId, RpcSender>) -> Self {
        Self {
            peers: std::sync::Arc::new(parking_lot::RwLock::new(peers)),
        }
    }

    /// Add (or restore) a link to a peer.
    pub fn add_peer(&self, peer_id: ReplicaId, sender: RpcSender) {
        self.peers.write().insert(peer_id, sender);
    }

    /// Sever the link to a peer. RPCs to it fail until it is re-added.
    pub fn remove_peer(&self, peer_id: ReplicaId) {
        self.peers.write().remove(&peer_id);
    }

    fn get_peer(&self, peer_id: ReplicaId) -> Option<RpcSender> {
        self.peers.read().get(&peer_id).cloned()
    }
}

fn unreachable_peer(target: ReplicaId) -> crate::error::RaftError {
    std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("peer not reachable: {}", target),
    )
    .into()
}

fn link_dropped(target: ReplicaId) -> crate::error::RaftError {
    std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("link to {} dropped mid-request", target),
    )
    .into()
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: ReplicaId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let peer = self.get_peer(target).ok_or_else(|| unreachable_peer(target))?;

        let (response_tx, response_rx) = tokio::sync::oneshot::channel();
        peer.send(RpcMessage::RequestVote {
            request,
            response_tx,
        })
        .await
        .map_err(|_| link_dropped(target))?;

        response_rx.await.map_err(|_| link_dropped(target))
    }

    async fn append_entries(
        &self,
        target: ReplicaId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let peer = self.get_peer(target).ok_or_else(|| unreachable_peer(target))?;

        let (response_tx, response_rx) = tokio::sync::oneshot::channel();
        peer.send(RpcMessage::AppendEntries {
            request,
            response_tx,
        })
        .await
        .map_err(|_| link_dropped(target))?;

        response_rx.await.map_err(|_| link_dropped(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_in_memory_transport_request_vote() {
        let (tx1, mut rx1) = tokio::sync::mpsc::channel(10);

        let mut peers = HashMap::new();
        peers.insert(ReplicaId(1), tx1);

        let transport = InMemoryTransport::new(peers);

        // Respond to the RPC from the "peer" side.
        tokio::spawn(async move {
            if let Some(RpcMessage::RequestVote {
                request: _,
                response_tx,
            }) = rx1.recv().await
            {
                let _ = response_tx.send(RequestVoteResponse {
                    term: Term(5),
                    vote_granted: true,
                });
            }
        });

        let request = RequestVoteRequest {
            term: Term(5),
            candidate_id: ReplicaId(0),
            last_log_index: LogIndex(10),
            last_log_term: Term(4),
        };

        let response = transport.request_vote(ReplicaId(1), request).await.unwrap();
        assert_eq!(response.term, Term(5));
        assert!(response.vote_granted);
    }

    #[tokio::test]
    async fn test_in_memory_transport_peer_not_found() {
        let transport = InMemoryTransport::new(HashMap::new());

        let request = RequestVoteRequest {
            term: Term(5),
            candidate_id: ReplicaId(0),
            last_log_index: LogIndex(10),
            last_log_term: Term(4),
        };

        let response = transport.request_vote(ReplicaId(9), request).await;
        assert!(matches!(
            response.unwrap_err(),
            crate::error::RaftError::Io(_)
        ));
    }

    #[tokio::test]
    async fn test_removed_peer_is_unreachable() {
        let (tx1, _rx1) = tokio::sync::mpsc::channel(10);
        let mut peers = HashMap::new();
        peers.insert(ReplicaId(1), tx1);

        let transport = InMemoryTransport::new(peers);
        transport.remove_peer(ReplicaId(1));

        let request = AppendEntriesRequest {
            term: Term(1),
            leader_id: ReplicaId(0),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: vec![],
            leader_commit: LogIndex::ZERO,
        };
        assert!(transport.append_entries(ReplicaId(1), request).await.is_err());
    }
}
