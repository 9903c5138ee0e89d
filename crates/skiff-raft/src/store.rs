//! Durable Raft state: the entry log and the term/vote metadata.
//!
//! Two files live in the storage directory:
//! - `log.bin`: the entry log, one checksummed record per entry
//! - `state.bin`: the `{current_term, voted_for}` pair
//!
//! Every mutation is fsynced before it returns. That is the contract the
//! RPC handlers rely on: a vote or an appended entry is on disk before the
//! response leaves this node.
//!
//! The full log is kept in memory (rebuilt from disk on open), so reads
//! are synchronous and cheap; only mutations touch the file system.

use crate::error::{RaftError, Result};
use crate::types::{LogEntry, LogIndex, ReplicaId, Term};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use skiff_wal::{LogFile, Record, RecoveryInfo, StateFile};
use std::path::Path;

const LOG_FILE: &str = "log.bin";
const STATE_FILE: &str = "state.bin";

/// The term/vote pair that must survive crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<ReplicaId>,
}

impl Default for HardState {
    fn default() -> Self {
        Self {
            term: Term::ZERO,
            voted_for: None,
        }
    }
}

/// Durable log store with an in-memory copy of all entries.
pub struct LogStore {
    log: LogFile,
    meta: StateFile<HardState>,
    entries: RwLock<Vec<LogEntry>>,
    hard_state: RwLock<HardState>,
}

impl LogStore {
    /// Opens the store in `dir`, recovering both files.
    ///
    /// A torn tail on the entry log (crash mid-append) is truncated at the
    /// last valid record boundary; the lost suffix was never acknowledged.
    pub async fn open(dir: impl AsRef<Path>) -> Result<(Self, RecoveryInfo)> {
        let dir = dir.as_ref();
        let (log, recovery) = LogFile::open(dir.join(LOG_FILE)).await?;
        let meta = StateFile::new(dir.join(STATE_FILE));

        let hard_state = meta.load().await?.unwrap_or_default();

        let mut entries = Vec::with_capacity(recovery.valid_records as usize);
        for record in log.read_all().await? {
            let entry: LogEntry = bincode::deserialize(&record.payload)?;
            let expected = LogIndex(entries.len() as u64 + 1);
            if entry.index != expected {
                return Err(RaftError::Internal {
                    reason: format!(
                        "log entry at position {} has index {}, expected {}",
                        entries.len(),
                        entry.index,
                        expected
                    ),
                });
            }
            entries.push(entry);
        }

        Ok((
            Self {
                log,
                meta,
                entries: RwLock::new(entries),
                hard_state: RwLock::new(hard_state),
            },
            recovery,
        ))
    }

    /// The current term/vote pair.
    pub fn hard_state(&self) -> HardState {
        *self.hard_state.read()
    }

    /// Durably records a new term/vote pair.
    ///
    /// Must complete before any RPC response that depends on it is sent.
    pub async fn set_hard_state(&self, term: Term, voted_for: Option<ReplicaId>) -> Result<()> {
        let hs = HardState { term, voted_for };
        self.meta.store(&hs).await?;
        *self.hard_state.write() = hs;
        Ok(())
    }

    /// Index of the last entry, or `LogIndex::ZERO` for an empty log.
    pub fn last_index(&self) -> LogIndex {
        LogIndex(self.entries.read().len() as u64)
    }

    /// Term of the last entry, or `Term::ZERO` for an empty log.
    pub fn last_term(&self) -> Term {
        self.entries
            .read()
            .last()
            .map(|e| e.term)
            .unwrap_or(Term::ZERO)
    }

    /// Term of the entry at `index`, if present.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.entry(index).map(|e| e.term)
    }

    /// The entry at `index`, if present.
    pub fn entry(&self, index: LogIndex) -> Option<LogEntry> {
        if index == LogIndex::ZERO {
            return None;
        }
        self.entries
            .read()
            .get(index.as_u64() as usize - 1)
            .cloned()
    }

    /// Entries in `[from, to)`, clamped to what exists.
    pub fn entries_in(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
        if from == LogIndex::ZERO || from >= to {
            return Vec::new();
        }
        let entries = self.entries.read();
        let start = (from.as_u64() as usize - 1).min(entries.len());
        let end = (to.as_u64() as usize - 1).min(entries.len());
        entries[start..end].to_vec()
    }

    /// All entries from `from` to the end of the log.
    pub fn entries_from(&self, from: LogIndex) -> Vec<LogEntry> {
        self.entries_in(from, self.last_index().next())
    }

    /// Durably appends entries to the end of the log.
    ///
    /// Entries must continue the log exactly (first index = last_index + 1).
    /// Returns only after the data is fsynced.
    pub async fn append(&self, new_entries: &[LogEntry]) -> Result<()> {
        if new_entries.is_empty() {
            return Ok(());
        }

        let expected = self.last_index().next();
        if new_entries[0].index != expected {
            return Err(RaftError::Internal {
                reason: format!(
                    "append at {} does not continue log ending at {}",
                    new_entries[0].index,
                    self.last_index()
                ),
            });
        }

        let mut records = Vec::with_capacity(new_entries.len());
        for entry in new_entries {
            records.push(Record::new(bincode::serialize(entry)?));
        }
        self.log.append_batch(&records).await?;
        self.log.sync().await?;

        self.entries.write().extend_from_slice(new_entries);
        Ok(())
    }

    /// Durably discards all entries at `index` and beyond.
    ///
    /// Used when a follower's log conflicts with the leader's. The
    /// surviving prefix is rewritten atomically, so a crash mid-truncate
    /// never leaves a mixed log.
    pub async fn truncate_from(&self, index: LogIndex) -> Result<()> {
        if index == LogIndex::ZERO {
            return Err(RaftError::Internal {
                reason: "cannot truncate from index 0".to_string(),
            });
        }
        if index > self.last_index() {
            return Ok(());
        }

        let survivors: Vec<LogEntry> = {
            let entries = self.entries.read();
            entries[..index.as_u64() as usize - 1].to_vec()
        };

        let mut records = Vec::with_capacity(survivors.len());
        for entry in &survivors {
            records.push(Record::new(bincode::serialize(entry)?));
        }
        self.log.rewrite(&records).await?;

        *self.entries.write() = survivors;
        Ok(())
    }
}
