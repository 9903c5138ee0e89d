//! State machine application.
//!
//! Committed entries are applied strictly in log order, exactly once
//! per entry for the lifetime of the process (`last_applied` only moves
//! forward). The apply loop is the only place `last_applied` advances
//! and the only caller of `StateMachine::apply`.
//!
//! Proposals wait here too: the leader registers a commit waiter per
//! proposed entry, and the apply loop completes it with the state
//! machine's reply once the entry is applied. If leadership is lost
//! first, every pending waiter fails with `LeadershipLost`.

use crate::error::{RaftError, Result};
use crate::state::RaftState;
use crate::types::{EntryKind, LogEntry, LogIndex, Role, Term};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::time::interval;

/// The replicated state machine.
///
/// `apply` is handed committed entries in log order and returns the
/// reply bytes for the proposer. Applying the same log prefix must
/// always produce the same state, and apply must be total: a command
/// the state machine cannot honor (key missing, CAS mismatch) is a
/// normal reply, not an error.
pub trait StateMachine: Send {
    fn apply(&mut self, entry: &LogEntry) -> Bytes;
}

struct Waiter {
    /// Term of the entry the proposer appended. If a different term is
    /// applied at this index, the original entry was overwritten.
    term: Term,
    tx: oneshot::Sender<Result<Bytes>>,
}

/// Pending proposals, keyed by the log index they were appended at.
#[derive(Default)]
pub struct CommitWaiters {
    inner: Mutex<HashMap<LogIndex, Waiter>>,
}

impl CommitWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the entry proposed at `index` in `term`.
    pub fn register(&self, index: LogIndex, term: Term) -> oneshot::Receiver<Result<Bytes>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().insert(index, Waiter { term, tx });
        rx
    }

    /// Drop the waiter at `index` (proposal timed out on the caller side).
    pub fn remove(&self, index: LogIndex) {
        self.inner.lock().remove(&index);
    }

    /// Complete the waiter at `index` with the applied entry's outcome.
    fn complete(&self, index: LogIndex, applied_term: Term, reply: Bytes) {
        if let Some(waiter) = self.inner.lock().remove(&index) {
            let outcome = if waiter.term == applied_term {
                Ok(reply)
            } else {
                // Another leader's entry landed at this index; the
                // original proposal is gone.
                Err(RaftError::LeadershipLost)
            };
            let _ = waiter.tx.send(outcome);
        }
    }

    /// Fail every pending waiter with `LeadershipLost`.
    fn fail_all(&self) {
        let drained: Vec<Waiter> = {
            let mut inner = self.inner.lock();
            inner.drain().map(|(_, w)| w).collect()
        };
        for waiter in drained {
            let _ = waiter.tx.send(Err(RaftError::LeadershipLost));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Apply loop: feed committed entries to the state machine.
///
/// Ticks at `apply_interval`, applying everything in
/// `(last_applied, commit_index]` in order. `ConfigChange` entries
/// advance `last_applied` without touching the state machine.
pub async fn apply_loop(
    state: Arc<RaftState>,
    state_machine: Arc<tokio::sync::Mutex<dyn StateMachine>>,
    waiters: Arc<CommitWaiters>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval(state.config().apply_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                apply_ready_entries(&state, &state_machine, &waiters).await;

                // A node that is not leader holds no promises to clients.
                if state.role() != Role::Leader && !waiters.is_empty() {
                    waiters.fail_all();
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("apply loop shutting down");
                waiters.fail_all();
                break;
            }
        }
    }
}

async fn apply_ready_entries(
    state: &Arc<RaftState>,
    state_machine: &Arc<tokio::sync::Mutex<dyn StateMachine>>,
    waiters: &Arc<CommitWaiters>,
) {
    let last_applied = state.last_applied();
    let commit_index = state.commit_index();
    if commit_index <= last_applied {
        return;
    }

    let entries = state
        .store()
        .entries_in(last_applied.next(), commit_index.next());

    for entry in entries {
        let reply = match entry.kind {
            EntryKind::Normal => {
                let mut sm = state_machine.lock().await;
                sm.apply(&entry)
            }
            EntryKind::ConfigChange => Bytes::new(),
        };

        waiters.complete(entry.index, entry.term, reply);
        state.set_last_applied(entry.index);
    }
}
