//! Error types for the consensus core.
//!
//! Errors split into three classes:
//! - Fatal: storage and I/O failures. The node cannot continue safely.
//! - Recoverable: the client should retry, possibly against another node
//!   (`NotLeader`, `CommitTimeout`, `LeadershipLost`).
//! - Silent: stale RPC traffic that is dropped without surfacing anywhere.
//!   Those never become a `RaftError`; handlers simply reply with the
//!   current term and `success = false`.

use crate::types::ReplicaId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaftError {
    /// Proposal sent to a non-leader. Carries the leader hint if known.
    #[error("not the leader (leader hint: {leader:?})")]
    NotLeader { leader: Option<ReplicaId> },

    /// The proposal was accepted into the log but did not commit in time.
    ///
    /// The command may still commit later; the caller must treat the
    /// outcome as unknown.
    #[error("proposal did not commit within {elapsed_ms}ms")]
    CommitTimeout { elapsed_ms: u64 },

    /// Leadership was lost while a proposal was pending. The entry may
    /// have been overwritten by the new leader's log.
    #[error("leadership lost while proposal was pending")]
    LeadershipLost,

    /// Invalid cluster or node configuration.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("storage error: {0}")]
    Storage(#[from] skiff_wal::WalError),

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl RaftError {
    /// True if the caller can retry (possibly against a different node).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. }
                | RaftError::CommitTimeout { .. }
                | RaftError::LeadershipLost
        )
    }

    /// True if the node must stop: acknowledged durable state can no
    /// longer be trusted, so continuing risks contradicting it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Io(_) | RaftError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
