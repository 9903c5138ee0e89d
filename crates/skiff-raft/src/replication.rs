//! Log replication for Raft.
//!
//! Per Raft §5.3 (Log Replication):
//! - Leader sends AppendEntries RPCs to replicate log entries
//! - AppendEntries also serves as heartbeat (prevents elections)
//! - Leader tracks next_index and match_index for each follower
//! - Leader commits entries when replicated on majority
//!
//! Replication is leader-paced: every heartbeat tick sends each
//! follower whatever it is missing (or an empty heartbeat), processes
//! the responses, and then tries to advance the commit index.

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::state::RaftState;
use crate::transport::RaftTransport;
use crate::types::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Replicate to a single follower.
///
/// Sends AppendEntries with entries starting from next_index[follower],
/// capped at `max_entries_per_append`. Updates next_index and
/// match_index from the response; a conflict hint moves next_index
/// back, a higher term makes the leader step down.
///
/// Returns true if the follower acknowledged up to our send point.
pub async fn replicate_to_follower(
    state: &Arc<RaftState>,
    follower: ReplicaId,
    transport: &Arc<dyn RaftTransport>,
) -> Result<bool> {
    let next_idx = match state.next_index_for(follower) {
        Some(idx) => idx,
        None => return Ok(false), // not leader anymore
    };

    let prev_log_index = next_idx.prev().unwrap_or(LogIndex::ZERO);
    let prev_log_term = if prev_log_index == LogIndex::ZERO {
        Term::ZERO
    } else {
        match state.store().term_at(prev_log_index) {
            Some(term) => term,
            // next_index points past a log we no longer agree with
            // ourselves about (race with truncation); retry next tick.
            None => return Ok(false),
        }
    };

    let mut entries = state.store().entries_from(next_idx);
    entries.truncate(state.config().max_entries_per_append);

    let current_term = state.current_term();
    let request = AppendEntriesRequest {
        term: current_term,
        leader_id: state.id(),
        prev_log_index,
        prev_log_term,
        entries: entries.clone(),
        leader_commit: state.commit_index(),
    };

    let response = match tokio::time::timeout(
        state.config().rpc_timeout,
        transport.append_entries(follower, request),
    )
    .await
    {
        Ok(Ok(response)) => response,
        // Unreachable or slow peer: retry on the next heartbeat tick.
        Ok(Err(_)) | Err(_) => return Ok(false),
    };

    if response.term > current_term {
        tracing::info!(
            follower = %follower,
            term = %response.term,
            "stepping down: follower has higher term"
        );
        state.step_down(response.term).await?;
        return Ok(false);
    }

    // A response from an older term of ours is stale; drop it.
    if response.term < current_term {
        return Ok(false);
    }

    if response.success {
        let acked = if entries.is_empty() {
            prev_log_index
        } else {
            entries.last().map(|e| e.index).unwrap_or(prev_log_index)
        };
        state.record_replicated(follower, acked);
        Ok(true)
    } else {
        let retry_from = response
            .conflict_index
            .unwrap_or_else(|| next_idx.prev().unwrap_or(LogIndex(1)));
        state.record_conflict(follower, retry_from);
        Ok(false)
    }
}

/// Advance commit index based on match_index.
///
/// Per Raft §5.3:
/// If there exists an N such that N > commitIndex, a majority of
/// matchIndex[i] >= N, and log[N].term == currentTerm:
/// set commitIndex = N
///
/// The current-term restriction is what prevents the figure 8 anomaly:
/// entries from older terms commit only implicitly, once a current-term
/// entry on top of them reaches a majority.
///
/// Returns true if commit index advanced.
pub fn advance_commit_index(state: &Arc<RaftState>) -> bool {
    let current_term = state.current_term();
    let current_commit = state.commit_index();

    let match_indices = match state.match_indexes() {
        Some(indices) => indices,
        None => return false, // not leader
    };

    let mut candidates: Vec<LogIndex> = match_indices
        .iter()
        .filter(|&&idx| idx > current_commit)
        .copied()
        .collect();
    if candidates.is_empty() {
        return false;
    }
    candidates.sort_by(|a, b| b.cmp(a));

    let quorum = state.cluster().majority();
    for candidate in candidates {
        let count = match_indices.iter().filter(|&&idx| idx >= candidate).count();
        if count >= quorum && state.store().term_at(candidate) == Some(current_term) {
            return state.set_commit_index(candidate);
        }
    }

    false
}

/// One replication round: all followers in parallel, then commit.
///
/// Transport failures are absorbed per follower; an `Err` here is a
/// storage failure (a step-down that could not persist) and the node
/// must not keep leading on top of it.
pub async fn broadcast_append_entries(
    state: &Arc<RaftState>,
    transport: &Arc<dyn RaftTransport>,
) -> Result<()> {
    let followers = state.cluster().peers(state.id());

    let futures = followers
        .into_iter()
        .map(|follower| {
            let state = state.clone();
            let transport = transport.clone();
            async move { replicate_to_follower(&state, follower, &transport).await }
        })
        .collect::<Vec<_>>();

    for result in futures::future::join_all(futures).await {
        result?;
    }

    advance_commit_index(state);
    Ok(())
}

/// Heartbeat loop for leader.
///
/// Sends AppendEntries (heartbeat or with entries) to all followers at
/// regular intervals. Does nothing while we are not leader. A storage
/// failure is reported on `fatal_tx` and stops the loop.
pub async fn heartbeat_loop(
    state: Arc<RaftState>,
    config: RaftConfig,
    transport: Arc<dyn RaftTransport>,
    fatal_tx: mpsc::Sender<RaftError>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = interval(config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if state.role() != Role::Leader {
                    continue;
                }
                if let Err(e) = broadcast_append_entries(&state, &transport).await {
                    tracing::error!(error = %e, "storage failure during replication, stopping");
                    let _ = fatal_tx.try_send(e);
                    break;
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("heartbeat loop shutting down");
                break;
            }
        }
    }
}
