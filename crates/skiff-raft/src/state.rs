//! Raft state machine (Follower, Candidate, Leader roles and transitions).
//!
//! The state machine handles:
//! - Role transitions (Follower → Candidate → Leader → Follower)
//! - RPC handling (RequestVote, AppendEntries)
//! - Log replication bookkeeping and commitment
//!
//! # Persistent State (survives crashes)
//!
//! - `current_term`: Latest term server has seen
//! - `voted_for`: Candidate that received vote in current term (None if haven't voted)
//! - `log`: Log entries (stored in LogStore)
//!
//! Persistent state is fsynced BEFORE the RPC response that depends on it
//! is sent. A node that grants a vote and then crashes must remember the
//! vote on restart, or two leaders could be elected in the same term.
//!
//! # Volatile State (all servers)
//!
//! - `commit_index`: Index of highest log entry known to be committed
//! - `last_applied`: Index of highest log entry applied to state machine
//!
//! # Volatile State (leaders only)
//!
//! - `next_index[]`: For each follower, index of next log entry to send
//! - `match_index[]`: For each follower, index of highest log entry known to be replicated

use crate::cluster::ClusterConfig;
use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::store::LogStore;
use crate::types::*;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Raft node state machine.
///
/// Encapsulates all Raft state and logic for a single node.
/// Thread-safe via internal locking.
pub struct RaftState {
    /// This node's ID
    id: ReplicaId,

    /// Raft configuration (timeouts, limits, etc.)
    config: RaftConfig,

    /// Static cluster membership
    cluster: ClusterConfig,

    /// Durable state (term, voted_for, log)
    store: LogStore,

    /// Volatile state (role, commit_index, etc.)
    volatile: RwLock<VolatileState>,

    /// Serializes every term/vote/log mutation. Mutations involve an
    /// async fsync, so a sync lock cannot cover the whole read-decide-
    /// persist sequence.
    op_lock: Mutex<()>,
}

/// Volatile state (lost on crash, recomputed on recovery).
pub struct VolatileState {
    /// Current role (Follower, Candidate, or Leader)
    pub role: Role,

    /// Current leader (if known)
    /// Followers track this to redirect client requests
    pub leader_id: Option<ReplicaId>,

    /// Highest log index known to be committed
    pub commit_index: LogIndex,

    /// Highest log index applied to state machine
    pub last_applied: LogIndex,

    /// Leader-specific state (only valid when role == Leader)
    pub leader_state: Option<LeaderState>,
}

/// Leader-specific volatile state.
///
/// Only valid when role == Leader.
/// Tracks replication progress for each follower.
pub struct LeaderState {
    /// For each peer, index of next log entry to send
    /// Initialized to leader's last_index + 1
    pub next_index: HashMap<ReplicaId, LogIndex>,

    /// For each peer, index of highest log entry known to be replicated
    /// Initialized to 0
    pub match_index: HashMap<ReplicaId, LogIndex>,
}

impl RaftState {
    pub fn new(id: ReplicaId, config: RaftConfig, cluster: ClusterConfig, store: LogStore) -> Self {
        Self {
            id,
            config,
            cluster,
            store,
            volatile: RwLock::new(VolatileState {
                role: Role::Follower,
                leader_id: None,
                commit_index: LogIndex::ZERO,
                last_applied: LogIndex::ZERO,
                leader_state: None,
            }),
            op_lock: Mutex::new(()),
        }
    }

    /// Get this node's ID.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Get the current role.
    pub fn role(&self) -> Role {
        self.volatile.read().role
    }

    /// Get the current term.
    pub fn current_term(&self) -> Term {
        self.store.hard_state().term
    }

    /// Get the current leader (if known).
    pub fn leader(&self) -> Option<ReplicaId> {
        self.volatile.read().leader_id
    }

    /// Get the commit index.
    pub fn commit_index(&self) -> LogIndex {
        self.volatile.read().commit_index
    }

    /// Get the last applied index.
    pub fn last_applied(&self) -> LogIndex {
        self.volatile.read().last_applied
    }

    /// Get the cluster configuration.
    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    /// Get the Raft configuration.
    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Get a reference to the durable store.
    pub fn store(&self) -> &LogStore {
        &self.store
    }

    /// Handle RequestVote RPC.
    ///
    /// Invoked by candidate to gather votes.
    /// Returns vote granted/denied based on log up-to-dateness.
    pub async fn handle_request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let _serial = self.op_lock.lock().await;

        // If request term > current term, update our term and become follower
        if request.term > self.store.hard_state().term {
            self.step_down_locked(request.term).await?;
        }

        let hs = self.store.hard_state();
        let mut vote_granted = false;

        // Grant vote if:
        // 1. request.term >= current_term
        // 2. Haven't voted for anyone else in this term
        // 3. Candidate's log is at least as up-to-date as ours
        if request.term >= hs.term {
            let already_voted = hs.voted_for.map_or(false, |id| id != request.candidate_id);

            if !already_voted {
                let last_log_term = self.store.last_term();
                let last_log_index = self.store.last_index();
                let log_ok = request.last_log_term > last_log_term
                    || (request.last_log_term == last_log_term
                        && request.last_log_index >= last_log_index);

                if log_ok {
                    // The vote must hit disk before the response leaves.
                    self.store
                        .set_hard_state(hs.term, Some(request.candidate_id))
                        .await?;
                    vote_granted = true;
                }
            }
        }

        Ok(RequestVoteResponse {
            term: self.store.hard_state().term,
            vote_granted,
        })
    }

    /// Handle AppendEntries RPC.
    ///
    /// Invoked by leader to:
    /// - Replicate log entries
    /// - Send heartbeats (empty entries)
    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let _serial = self.op_lock.lock().await;

        // If request term > current term, update and step down
        if request.term > self.store.hard_state().term {
            self.step_down_locked(request.term).await?;
        }

        let current_term = self.store.hard_state().term;

        // Stale leader: reply with our term so it steps down.
        if request.term < current_term {
            return Ok(AppendEntriesResponse {
                term: current_term,
                success: false,
                conflict_index: None,
                last_log_index: self.store.last_index(),
            });
        }

        // Valid AppendEntries from current leader.
        {
            let mut volatile = self.volatile.write();
            volatile.leader_id = Some(request.leader_id);

            // A candidate or leader seeing same-term AppendEntries yields.
            if volatile.role != Role::Follower {
                if volatile.role == Role::Leader {
                    tracing::warn!(
                        term = %current_term,
                        from = %request.leader_id,
                        "leader stepping down after AppendEntries in same term"
                    );
                }
                volatile.role = Role::Follower;
                volatile.leader_state = None;
            }
        }

        // Consistency check: our log must contain prev_log_index with
        // prev_log_term, or the leader must back up.
        let log_ok = request.prev_log_index == LogIndex::ZERO
            || self.store.term_at(request.prev_log_index) == Some(request.prev_log_term);

        if !log_ok {
            let conflict_index = self.conflict_hint(request.prev_log_index);
            return Ok(AppendEntriesResponse {
                term: current_term,
                success: false,
                conflict_index: Some(conflict_index),
                last_log_index: self.store.last_index(),
            });
        }

        if !request.entries.is_empty() {
            self.reconcile_entries(&request.entries).await?;
        }

        // Commit may only cover what this request verified against the
        // leader's log: prev_log_index plus the entries it carried. An
        // uncommitted local tail beyond that is not vouched for and must
        // not be applied.
        let last_new_index =
            LogIndex(request.prev_log_index.as_u64() + request.entries.len() as u64);
        {
            let mut volatile = self.volatile.write();
            if request.leader_commit > volatile.commit_index {
                volatile.commit_index = std::cmp::min(request.leader_commit, last_new_index);
            }
        }

        Ok(AppendEntriesResponse {
            term: current_term,
            success: true,
            conflict_index: None,
            last_log_index: self.store.last_index(),
        })
    }

    /// Merge leader entries into our log.
    ///
    /// Entries we already hold (same index, same term) are skipped, so a
    /// retransmitted request is idempotent. The first entry whose term
    /// disagrees with ours truncates our suffix before the leader's
    /// entries are appended.
    async fn reconcile_entries(&self, entries: &[LogEntry]) -> Result<()> {
        let mut first_new = None;
        for entry in entries {
            match self.store.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.store.truncate_from(entry.index).await?;
                    first_new = Some(entry.index);
                    break;
                }
                None => {
                    first_new = Some(entry.index);
                    break;
                }
            }
        }

        if let Some(first_new) = first_new {
            let offset = (first_new.as_u64() - entries[0].index.as_u64()) as usize;
            self.store.append(&entries[offset..]).await?;
        }
        Ok(())
    }

    /// Where the leader should retry after a failed consistency check.
    ///
    /// If our log is shorter than prev_log_index, retry from just past
    /// our end. Otherwise back up to the first index of the conflicting
    /// term, skipping the whole term in one round trip.
    fn conflict_hint(&self, prev_log_index: LogIndex) -> LogIndex {
        let last = self.store.last_index();
        if last < prev_log_index {
            return last.next();
        }

        let conflicting_term = match self.store.term_at(prev_log_index) {
            Some(term) => term,
            None => return last.next(),
        };

        let mut index = prev_log_index;
        while let Some(prev) = index.prev() {
            if prev == LogIndex::ZERO || self.store.term_at(prev) != Some(conflicting_term) {
                break;
            }
            index = prev;
        }
        index
    }

    /// Transition to candidate and start an election.
    ///
    /// Increments the term and votes for self, durably, then returns the
    /// vote request to broadcast.
    pub async fn start_election(&self) -> Result<RequestVoteRequest> {
        let _serial = self.op_lock.lock().await;

        let term = self.store.hard_state().term.next();
        self.store.set_hard_state(term, Some(self.id)).await?;

        {
            let mut volatile = self.volatile.write();
            volatile.role = Role::Candidate;
            volatile.leader_state = None;
        }

        Ok(RequestVoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: self.store.last_index(),
            last_log_term: self.store.last_term(),
        })
    }

    /// Transition to leader (after winning election in `term`).
    ///
    /// Returns false if the election result is stale: the term moved on
    /// or we already stepped down while votes were in flight.
    pub async fn become_leader(&self, term: Term) -> Result<bool> {
        let _serial = self.op_lock.lock().await;

        if self.store.hard_state().term != term {
            return Ok(false);
        }

        let last_log_index = self.store.last_index();
        let mut volatile = self.volatile.write();
        if volatile.role != Role::Candidate {
            return Ok(false);
        }

        volatile.role = Role::Leader;
        volatile.leader_id = Some(self.id);

        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for peer in self.cluster.peers(self.id) {
            next_index.insert(peer, last_log_index.next());
            match_index.insert(peer, LogIndex::ZERO);
        }
        volatile.leader_state = Some(LeaderState {
            next_index,
            match_index,
        });

        Ok(true)
    }

    /// Step down if a higher term is observed in an RPC response.
    pub async fn step_down(&self, observed_term: Term) -> Result<()> {
        let _serial = self.op_lock.lock().await;
        if observed_term > self.store.hard_state().term {
            self.step_down_locked(observed_term).await?;
        }
        Ok(())
    }

    /// Adopt `new_term` and become follower. Caller holds `op_lock`.
    async fn step_down_locked(&self, new_term: Term) -> Result<()> {
        self.store.set_hard_state(new_term, None).await?;
        let mut volatile = self.volatile.write();
        volatile.role = Role::Follower;
        volatile.leader_id = None;
        volatile.leader_state = None;
        Ok(())
    }

    /// Append a client command to the leader's log.
    ///
    /// The entry is durable when this returns; replication to followers
    /// happens asynchronously.
    pub async fn append_as_leader(&self, command: Bytes) -> Result<LogEntry> {
        Ok(self.append_as_leader_with(command, |_, _| ()).await?.0)
    }

    /// Append a client command, running `on_reserve` with the entry's
    /// index and term after the slot is decided but before the entry is
    /// visible to replication. Lets a proposer register interest in the
    /// outcome without racing the heartbeat tick, which could otherwise
    /// replicate and apply the entry before the registration lands.
    pub async fn append_as_leader_with<R>(
        &self,
        command: Bytes,
        on_reserve: impl FnOnce(LogIndex, Term) -> R,
    ) -> Result<(LogEntry, R)> {
        let _serial = self.op_lock.lock().await;

        {
            let volatile = self.volatile.read();
            if volatile.role != Role::Leader {
                return Err(RaftError::NotLeader {
                    leader: volatile.leader_id,
                });
            }
        }

        let term = self.store.hard_state().term;
        let index = self.store.last_index().next();
        let reserved = on_reserve(index, term);

        let entry = LogEntry::new(term, index, command);
        self.store.append(std::slice::from_ref(&entry)).await?;
        Ok((entry, reserved))
    }

    /// next_index for a follower. None if we are not leader.
    pub fn next_index_for(&self, peer: ReplicaId) -> Option<LogIndex> {
        let volatile = self.volatile.read();
        volatile
            .leader_state
            .as_ref()
            .and_then(|ls| ls.next_index.get(&peer).copied())
    }

    /// Record a successful AppendEntries to `peer` covering up to `last`.
    pub fn record_replicated(&self, peer: ReplicaId, last: LogIndex) {
        let mut volatile = self.volatile.write();
        if let Some(ls) = volatile.leader_state.as_mut() {
            ls.next_index.insert(peer, last.next());
            // match_index only moves forward; stale responses cannot
            // drag it back.
            let entry = ls.match_index.entry(peer).or_insert(LogIndex::ZERO);
            if last > *entry {
                *entry = last;
            }
        }
    }

    /// Record a rejected AppendEntries; retry from `next`.
    pub fn record_conflict(&self, peer: ReplicaId, next: LogIndex) {
        let mut volatile = self.volatile.write();
        if let Some(ls) = volatile.leader_state.as_mut() {
            ls.next_index.insert(peer, std::cmp::max(next, LogIndex(1)));
        }
    }

    /// All match indexes including our own last index. None if not leader.
    pub fn match_indexes(&self) -> Option<Vec<LogIndex>> {
        let volatile = self.volatile.read();
        let ls = volatile.leader_state.as_ref()?;
        let mut indexes: Vec<LogIndex> = ls.match_index.values().copied().collect();
        indexes.push(self.store.last_index());
        Some(indexes)
    }

    /// Advance the commit index. Returns true if it moved.
    pub fn set_commit_index(&self, index: LogIndex) -> bool {
        let mut volatile = self.volatile.write();
        if index > volatile.commit_index {
            volatile.commit_index = index;
            true
        } else {
            false
        }
    }

    /// Record that entries up to `index` have been applied.
    pub fn set_last_applied(&self, index: LogIndex) {
        let mut volatile = self.volatile.write();
        if index > volatile.last_applied {
            volatile.last_applied = index;
        }
    }
}
