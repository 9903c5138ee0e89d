//! Replicated key-value state machine.
//!
//! Commands are bincode-encoded into log entry payloads; replies travel
//! back to the proposer the same way. Every command is total: a missing
//! key or a failed compare-and-swap is a normal reply, never an error,
//! so every replica computes the same result for the same log.

use crate::applier::StateMachine;
use crate::error::Result;
use crate::types::LogEntry;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A state machine command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    /// Create `key` with `value`; fails if the key exists.
    Create { key: String, value: String },
    /// Update `key` to `value`; fails if the key is missing.
    Update { key: String, value: String },
    /// Delete `key`; fails if the key is missing.
    Delete { key: String },
    /// Set `key` to `swap` only if its current value is `expect`.
    Cas {
        key: String,
        expect: String,
        swap: String,
    },
}

impl KvCommand {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// The outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvReply {
    Created,
    AlreadyExists,
    Updated,
    Deleted,
    NotFound,
    /// CAS outcome: the value that was current before the command. The
    /// swap happened iff it equals the expected value.
    CasResult { previous: Option<String> },
    /// The entry payload was not a decodable command.
    Malformed,
}

impl KvReply {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// In-memory key-value store, driven entirely by the log.
#[derive(Debug, Default)]
pub struct KvStore {
    data: HashMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn apply_command(&mut self, command: KvCommand) -> KvReply {
        match command {
            KvCommand::Create { key, value } => {
                if self.data.contains_key(&key) {
                    KvReply::AlreadyExists
                } else {
                    self.data.insert(key, value);
                    KvReply::Created
                }
            }
            KvCommand::Update { key, value } => {
                if let Some(slot) = self.data.get_mut(&key) {
                    *slot = value;
                    KvReply::Updated
                } else {
                    KvReply::NotFound
                }
            }
            KvCommand::Delete { key } => {
                if self.data.remove(&key).is_some() {
                    KvReply::Deleted
                } else {
                    KvReply::NotFound
                }
            }
            KvCommand::Cas { key, expect, swap } => {
                let previous = self.data.get(&key).cloned();
                if previous.as_deref() == Some(expect.as_str()) {
                    self.data.insert(key, swap);
                }
                KvReply::CasResult { previous }
            }
        }
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, entry: &LogEntry) -> Bytes {
        let reply = match KvCommand::decode(&entry.command) {
            Ok(command) => self.apply_command(command),
            Err(e) => {
                tracing::error!(index = %entry.index, error = ?e, "undecodable command in log");
                KvReply::Malformed
            }
        };

        // Reply encoding cannot fail for these enums.
        reply.encode().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogIndex, Term};

    fn apply(store: &mut KvStore, command: KvCommand) -> KvReply {
        store.apply_command(command)
    }

    #[test]
    fn test_create_and_get() {
        let mut store = KvStore::new();
        assert_eq!(
            apply(
                &mut store,
                KvCommand::Create {
                    key: "a".into(),
                    value: "1".into(),
                }
            ),
            KvReply::Created
        );
        assert_eq!(store.get("a"), Some("1"));

        assert_eq!(
            apply(
                &mut store,
                KvCommand::Create {
                    key: "a".into(),
                    value: "2".into(),
                }
            ),
            KvReply::AlreadyExists
        );
        assert_eq!(store.get("a"), Some("1"));
    }

    #[test]
    fn test_update_requires_existing_key() {
        let mut store = KvStore::new();
        assert_eq!(
            apply(
                &mut store,
                KvCommand::Update {
                    key: "a".into(),
                    value: "1".into(),
                }
            ),
            KvReply::NotFound
        );

        apply(
            &mut store,
            KvCommand::Create {
                key: "a".into(),
                value: "1".into(),
            },
        );
        assert_eq!(
            apply(
                &mut store,
                KvCommand::Update {
                    key: "a".into(),
                    value: "2".into(),
                }
            ),
            KvReply::Updated
        );
        assert_eq!(store.get("a"), Some("2"));
    }

    #[test]
    fn test_delete() {
        let mut store = KvStore::new();
        apply(
            &mut store,
            KvCommand::Create {
                key: "a".into(),
                value: "1".into(),
            },
        );

        assert_eq!(
            apply(&mut store, KvCommand::Delete { key: "a".into() }),
            KvReply::Deleted
        );
        assert_eq!(
            apply(&mut store, KvCommand::Delete { key: "a".into() }),
            KvReply::NotFound
        );
    }

    #[test]
    fn test_cas() {
        let mut store = KvStore::new();
        apply(
            &mut store,
            KvCommand::Create {
                key: "a".into(),
                value: "1".into(),
            },
        );

        // Matching expectation swaps.
        assert_eq!(
            apply(
                &mut store,
                KvCommand::Cas {
                    key: "a".into(),
                    expect: "1".into(),
                    swap: "2".into(),
                }
            ),
            KvReply::CasResult {
                previous: Some("1".into())
            }
        );
        assert_eq!(store.get("a"), Some("2"));

        // Mismatched expectation leaves the value alone.
        assert_eq!(
            apply(
                &mut store,
                KvCommand::Cas {
                    key: "a".into(),
                    expect: "1".into(),
                    swap: "3".into(),
                }
            ),
            KvReply::CasResult {
                previous: Some("2".into())
            }
        );
        assert_eq!(store.get("a"), Some("2"));

        // CAS on a missing key reports no previous value.
        assert_eq!(
            apply(
                &mut store,
                KvCommand::Cas {
                    key: "missing".into(),
                    expect: "x".into(),
                    swap: "y".into(),
                }
            ),
            KvReply::CasResult { previous: None }
        );
    }

    #[test]
    fn test_command_roundtrip() {
        let command = KvCommand::Cas {
            key: "k".into(),
            expect: "old".into(),
            swap: "new".into(),
        };
        let decoded = KvCommand::decode(&command.encode().unwrap()).unwrap();
        assert_eq!(command, decoded);
    }

    #[test]
    fn test_apply_entry_through_trait() {
        let mut store = KvStore::new();
        let command = KvCommand::Create {
            key: "a".into(),
            value: "1".into(),
        };
        let entry = LogEntry::new(Term(1), LogIndex(1), command.encode().unwrap());

        let reply = StateMachine::apply(&mut store, &entry);
        assert_eq!(KvReply::decode(&reply).unwrap(), KvReply::Created);
        assert_eq!(store.get("a"), Some("1"));
    }

    #[test]
    fn test_malformed_command_yields_malformed_reply() {
        let mut store = KvStore::new();
        let entry = LogEntry::new(Term(1), LogIndex(1), Bytes::from_static(b"\xff\xff"));

        let reply = StateMachine::apply(&mut store, &entry);
        assert_eq!(KvReply::decode(&reply).unwrap(), KvReply::Malformed);
        assert!(store.is_empty());
    }

    #[test]
    fn test_same_commands_same_state() {
        let commands = vec![
            KvCommand::Create {
                key: "a".into(),
                value: "1".into(),
            },
            KvCommand::Update {
                key: "a".into(),
                value: "2".into(),
            },
            KvCommand::Create {
                key: "b".into(),
                value: "3".into(),
            },
            KvCommand::Delete { key: "b".into() },
        ];

        let mut first = KvStore::new();
        let mut second = KvStore::new();
        for command in &commands {
            first.apply_command(command.clone());
            second.apply_command(command.clone());
        }

        assert_eq!(first.get("a"), second.get("a"));
        assert_eq!(first.len(), second.len());
    }
}
