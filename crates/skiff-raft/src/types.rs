//! Core Raft types: Term, Index, Log Entries, RPC messages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raft term number (monotonically increasing).
///
/// Terms establish logical clocks in Raft. Each term has at most one leader.
/// When a server starts an election, it increments its term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log index (1-indexed, 0 is sentinel for "no entry").
///
/// Raft logs are 1-indexed. Index 0 represents "no entry" or "before the log".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 > 0 {
            Some(LogIndex(self.0 - 1))
        } else {
            None
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Replica identifier: the replica's position in the cluster configuration.
///
/// All replicas load the same configuration file, so the index into the
/// replica list is a stable, unique ID across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub u32);

impl ReplicaId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// What a log entry carries.
///
/// `Normal` entries hold a state machine command. `ConfigChange` entries
/// are replicated and committed like any other entry but are not handed
/// to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Normal,
    ConfigChange,
}

/// Log entry (command + metadata).
///
/// Each entry contains:
/// - `term`: Term when entry was created (for conflict detection)
/// - `index`: Position in log (for addressing)
/// - `command`: Opaque command bytes (interpreted by state machine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub kind: EntryKind,
    pub command: Bytes,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Bytes) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Normal,
            command,
        }
    }
}

/// RequestVote RPC request.
///
/// Sent by candidate to all peers during election.
/// Asks for vote to become leader in current term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting vote
    pub candidate_id: ReplicaId,

    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

/// RequestVote RPC response.
///
/// Sent by voter back to candidate.
/// Grants or denies vote based on log up-to-dateness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for candidate to update itself
    pub term: Term,

    /// True if candidate received vote
    pub vote_granted: bool,
}

/// AppendEntries RPC request.
///
/// Sent by leader to replicate log entries and/or send heartbeats.
/// Empty entries list = heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's ID (so follower can redirect clients)
    pub leader_id: ReplicaId,

    /// Index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,

    /// Term of prev_log_index entry
    pub prev_log_term: Term,

    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
///
/// Sent by follower back to leader.
/// Success indicates log consistency check passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for leader to update itself
    pub term: Term,

    /// True if follower contained entry matching prev_log_index/term
    pub success: bool,

    /// Hint for leader to backtrack faster on conflict
    pub conflict_index: Option<LogIndex>,

    /// Follower's last log index (for match_index tracking)
    pub last_log_index: LogIndex,
}

/// Raft role (Follower, Candidate, or Leader).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_ordering() {
        assert!(Term(2) > Term(1));
        assert_eq!(Term(5).next(), Term(6));
    }

    #[test]
    fn test_log_index_ordering() {
        assert!(LogIndex(10) > LogIndex(5));
        assert_eq!(LogIndex(5).next(), LogIndex(6));
        assert_eq!(LogIndex(5).prev(), Some(LogIndex(4)));
        assert_eq!(LogIndex(0).prev(), None);
    }

    #[test]
    fn test_entry_serialization_roundtrip() {
        let entry = LogEntry::new(Term(3), LogIndex(7), Bytes::from("set x=1"));
        let encoded = bincode::serialize(&entry).unwrap();
        let decoded: LogEntry = bincode::deserialize(&encoded).unwrap();
        assert_eq!(entry, decoded);
        assert_eq!(decoded.kind, EntryKind::Normal);
    }

    #[test]
    fn test_replica_id_display() {
        assert_eq!(ReplicaId(2).to_string(), "r2");
    }
}
