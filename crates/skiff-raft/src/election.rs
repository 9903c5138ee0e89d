//! Leader election.
//!
//! Per Raft §5.2 (Leader Election):
//! - A follower that hears nothing for an election timeout becomes a
//!   candidate, increments its term, and votes for itself
//! - It requests votes from all peers in parallel
//! - A majority of votes makes it leader; it immediately heartbeats to
//!   suppress further candidacies
//! - Seeing a higher term at any point makes it a follower again
//!
//! A lost or split election simply ends; the election timer fires again
//! with a fresh random timeout and a new term.

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::replication;
use crate::state::RaftState;
use crate::transport::RaftTransport;
use crate::types::*;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Election loop: turn timer expiries into elections.
///
/// Runs until shutdown. A leader ignores expiries (its own heartbeats
/// keep followers quiet, it has nothing to elect). An election that
/// fails because term or vote could not persist is fatal: it is
/// reported on `fatal_tx` and stops the loop.
pub async fn election_loop(
    state: Arc<RaftState>,
    config: RaftConfig,
    transport: Arc<dyn RaftTransport>,
    mut timeout_rx: broadcast::Receiver<()>,
    fatal_tx: mpsc::Sender<RaftError>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = timeout_rx.recv() => {
                match result {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if state.role() == Role::Leader {
                            continue;
                        }
                        if let Err(e) = run_election(&state, &config, &transport).await {
                            tracing::error!(error = %e, "storage failure during election, stopping");
                            let _ = fatal_tx.try_send(e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("election loop shutting down");
                break;
            }
        }
    }
}

/// Run a single election: bump term, solicit votes, maybe become leader.
pub async fn run_election(
    state: &Arc<RaftState>,
    config: &RaftConfig,
    transport: &Arc<dyn RaftTransport>,
) -> Result<()> {
    let request = state.start_election().await?;
    let term = request.term;
    tracing::info!(id = %state.id(), term = %term, "starting election");

    let peers = state.cluster().peers(state.id());
    let vote_futures = peers
        .into_iter()
        .map(|peer| {
            let transport = transport.clone();
            let request = request.clone();
            let rpc_timeout = config.rpc_timeout;
            async move {
                tokio::time::timeout(rpc_timeout, transport.request_vote(peer, request)).await
            }
        })
        .collect::<Vec<_>>();

    let results = join_all(vote_futures).await;

    let mut votes = 1usize; // our own vote
    let mut max_term = term;
    for result in results {
        // Timeouts and transport errors are just missing votes.
        if let Ok(Ok(response)) = result {
            if response.term > max_term {
                max_term = response.term;
            }
            if response.vote_granted && response.term == term {
                votes += 1;
            }
        }
    }

    if max_term > term {
        state.step_down(max_term).await?;
        return Ok(());
    }

    if votes >= state.cluster().majority() {
        if state.become_leader(term).await? {
            tracing::info!(id = %state.id(), term = %term, votes, "won election");
            // Assert leadership immediately rather than waiting for the
            // next heartbeat tick.
            replication::broadcast_append_entries(state, transport).await?;
        }
    } else {
        tracing::debug!(id = %state.id(), term = %term, votes, "election did not reach majority");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterConfig;
    use crate::store::LogStore;
    use crate::transport::{InMemoryTransport, RpcMessage};
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn create_test_state(cluster_size: usize) -> (Arc<RaftState>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let (store, _) = LogStore::open(temp_dir.path()).await.unwrap();

        let addrs = (0..cluster_size)
            .map(|i| format!("127.0.0.1:{}", 7001 + i).parse().unwrap())
            .collect();
        let cluster = ClusterConfig::from_addrs(addrs).unwrap();

        let state = Arc::new(RaftState::new(
            ReplicaId(0),
            RaftConfig::fast(),
            cluster,
            store,
        ));
        (state, temp_dir)
    }

    /// A peer task that always grants votes and accepts heartbeats.
    fn spawn_agreeable_peer(mut rx: tokio::sync::mpsc::Receiver<RpcMessage>) {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    RpcMessage::RequestVote {
                        request,
                        response_tx,
                    } => {
                        let _ = response_tx.send(RequestVoteResponse {
                            term: request.term,
                            vote_granted: true,
                        });
                    }
                    RpcMessage::AppendEntries {
                        request,
                        response_tx,
                    } => {
                        let _ = response_tx.send(AppendEntriesResponse {
                            term: request.term,
                            success: true,
                            conflict_index: None,
                            last_log_index: request.prev_log_index,
                        });
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn test_win_election_with_majority() {
        let (state, _temp) = create_test_state(3).await;

        let mut peers = HashMap::new();
        for id in [ReplicaId(1), ReplicaId(2)] {
            let (tx, rx) = tokio::sync::mpsc::channel(10);
            peers.insert(id, tx);
            spawn_agreeable_peer(rx);
        }
        let transport: Arc<dyn RaftTransport> = Arc::new(InMemoryTransport::new(peers));

        run_election(&state, &RaftConfig::fast(), &transport)
            .await
            .unwrap();

        assert_eq!(state.role(), Role::Leader);
        assert_eq!(state.current_term(), Term(1));
        assert_eq!(state.leader(), Some(ReplicaId(0)));
    }

    #[tokio::test]
    async fn test_lose_election_without_majority() {
        let (state, _temp) = create_test_state(3).await;

        // Both peers unreachable: only our own vote.
        let transport: Arc<dyn RaftTransport> = Arc::new(InMemoryTransport::new(HashMap::new()));

        run_election(&state, &RaftConfig::fast(), &transport)
            .await
            .unwrap();

        assert_eq!(state.role(), Role::Candidate);
        assert_eq!(state.current_term(), Term(1));
    }

    #[tokio::test]
    async fn test_single_node_cluster_elects_itself() {
        let (state, _temp) = create_test_state(1).await;
        let transport: Arc<dyn RaftTransport> = Arc::new(InMemoryTransport::new(HashMap::new()));

        run_election(&state, &RaftConfig::fast(), &transport)
            .await
            .unwrap();

        assert_eq!(state.role(), Role::Leader);
    }

    #[tokio::test]
    async fn test_step_down_on_higher_term_in_vote_response() {
        let (state, _temp) = create_test_state(3).await;

        let (tx, mut rx) = tokio::sync::mpsc::channel(10);
        let mut peers = HashMap::new();
        peers.insert(ReplicaId(1), tx);
        tokio::spawn(async move {
            if let Some(RpcMessage::RequestVote { response_tx, .. }) = rx.recv().await {
                let _ = response_tx.send(RequestVoteResponse {
                    term: Term(8),
                    vote_granted: false,
                });
            }
        });
        let transport: Arc<dyn RaftTransport> = Arc::new(InMemoryTransport::new(peers));

        run_election(&state, &RaftConfig::fast(), &transport)
            .await
            .unwrap();

        assert_eq!(state.role(), Role::Follower);
        assert_eq!(state.current_term(), Term(8));
    }

    #[tokio::test]
    async fn test_repeated_elections_bump_term() {
        let (state, _temp) = create_test_state(3).await;
        let transport: Arc<dyn RaftTransport> = Arc::new(InMemoryTransport::new(HashMap::new()));

        for expected in 1..=3u64 {
            run_election(&state, &RaftConfig::fast(), &transport)
                .await
                .unwrap();
            assert_eq!(state.current_term(), Term(expected));
        }
    }
}
