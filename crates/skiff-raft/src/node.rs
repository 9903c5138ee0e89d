//! Node supervisor: one Raft replica, fully assembled.
//!
//! `Node::open` recovers durable state from the storage directory and
//! wires the state machine, transport, and configuration together.
//! `Node::start` spawns the background tasks:
//! - election timer (randomized countdown)
//! - election loop (timer expiry -> candidacy)
//! - heartbeat loop (leader-paced replication and commit)
//! - apply loop (committed entries -> state machine, proposal replies)
//! - RPC handler loop (inbound traffic -> state handlers)
//!
//! `propose` is the client-facing write path: leader-only, returns the
//! state machine's reply once the command is committed and applied.

use crate::applier::{self, CommitWaiters, StateMachine};
use crate::cluster::ClusterConfig;
use crate::config::RaftConfig;
use crate::election;
use crate::error::{RaftError, Result};
use crate::replication;
use crate::rpc_handler;
use crate::state::RaftState;
use crate::store::LogStore;
use crate::timer::ElectionTimer;
use crate::transport::{RaftTransport, RpcReceiver};
use crate::types::{LogIndex, ReplicaId, Role, Term};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};

pub struct Node {
    state: Arc<RaftState>,
    transport: Arc<dyn RaftTransport>,
    election_timer: Arc<ElectionTimer>,
    waiters: Arc<CommitWaiters>,
    state_machine: Arc<tokio::sync::Mutex<dyn StateMachine>>,
    shutdown_tx: broadcast::Sender<()>,
    fatal_tx: mpsc::Sender<RaftError>,
    fatal_rx: tokio::sync::Mutex<mpsc::Receiver<RaftError>>,
    rpc_rx: parking_lot::Mutex<Option<RpcReceiver>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").finish_non_exhaustive()
    }
}

impl Node {
    /// Open a replica, recovering term, vote, and log from `storage_dir`.
    ///
    /// The directory must exist; the files inside it are created on
    /// first use. Background tasks do not run until [`start`].
    ///
    /// [`start`]: Node::start
    pub async fn open(
        id: ReplicaId,
        config: RaftConfig,
        cluster: ClusterConfig,
        storage_dir: impl AsRef<Path>,
        transport: Arc<dyn RaftTransport>,
        state_machine: Arc<tokio::sync::Mutex<dyn StateMachine>>,
        rpc_rx: RpcReceiver,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|reason| RaftError::Config { reason })?;
        if !cluster.contains(id) {
            return Err(RaftError::Config {
                reason: format!("replica {} is not in the cluster configuration", id),
            });
        }

        let (store, recovery) = LogStore::open(storage_dir).await?;
        tracing::info!(
            id = %id,
            term = %store.hard_state().term,
            entries = store.last_index().as_u64(),
            truncated_bytes = recovery.truncated_bytes,
            "opened replica storage"
        );

        let election_timer = Arc::new(ElectionTimer::new(config.clone()));
        let state = Arc::new(RaftState::new(id, config, cluster, store));
        let (shutdown_tx, _) = broadcast::channel(8);
        let (fatal_tx, fatal_rx) = mpsc::channel(4);

        Ok(Self {
            state,
            transport,
            election_timer,
            waiters: Arc::new(CommitWaiters::new()),
            state_machine,
            shutdown_tx,
            fatal_tx,
            fatal_rx: tokio::sync::Mutex::new(fatal_rx),
            rpc_rx: parking_lot::Mutex::new(Some(rpc_rx)),
        })
    }

    /// Spawn the background tasks. Call once.
    pub fn start(&self) -> Result<()> {
        let rpc_rx = self
            .rpc_rx
            .lock()
            .take()
            .ok_or_else(|| RaftError::Internal {
                reason: "node already started".to_string(),
            })?;

        let config = self.state.config().clone();

        {
            let timer = self.election_timer.clone();
            tokio::spawn(async move { timer.run().await });
        }

        tokio::spawn(election::election_loop(
            self.state.clone(),
            config.clone(),
            self.transport.clone(),
            self.election_timer.subscribe(),
            self.fatal_tx.clone(),
            self.shutdown_tx.subscribe(),
        ));

        tokio::spawn(replication::heartbeat_loop(
            self.state.clone(),
            config,
            self.transport.clone(),
            self.fatal_tx.clone(),
            self.shutdown_tx.subscribe(),
        ));

        tokio::spawn(applier::apply_loop(
            self.state.clone(),
            self.state_machine.clone(),
            self.waiters.clone(),
            self.shutdown_tx.subscribe(),
        ));

        tokio::spawn(rpc_handler::rpc_handler_loop(
            self.state.clone(),
            rpc_rx,
            self.election_timer.clone(),
            self.fatal_tx.clone(),
            self.shutdown_tx.subscribe(),
        ));

        tracing::info!(id = %self.state.id(), "replica started");
        Ok(())
    }

    /// Propose a command and wait for it to commit and apply.
    ///
    /// Returns the state machine's reply. Errors:
    /// - `NotLeader`: try the hinted leader instead
    /// - `CommitTimeout`: outcome unknown, the entry may still commit
    /// - `LeadershipLost`: the entry was (or may have been) overwritten
    pub async fn propose(&self, command: Bytes) -> Result<Bytes> {
        let start = Instant::now();

        // The waiter must exist before the entry does: the heartbeat
        // loop can replicate, commit, and apply a visible entry on its
        // own, and a registration landing after that would wait for an
        // answer that was already delivered.
        let (entry, rx) = match self
            .state
            .append_as_leader_with(command, |index, term| self.waiters.register(index, term))
            .await
        {
            Ok(appended) => appended,
            Err(e) => {
                if e.is_fatal() {
                    let _ = self.fatal_tx.try_send(RaftError::Internal {
                        reason: e.to_string(),
                    });
                }
                return Err(e);
            }
        };

        // Push the entry out now rather than waiting for the next
        // heartbeat tick.
        if let Err(e) = replication::broadcast_append_entries(&self.state, &self.transport).await {
            self.waiters.remove(entry.index);
            let _ = self.fatal_tx.try_send(RaftError::Internal {
                reason: e.to_string(),
            });
            return Err(e);
        }

        let timeout = self.state.config().propose_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // The waiter was dropped without an answer: stepped down.
            Ok(Err(_)) => Err(RaftError::LeadershipLost),
            Err(_) => {
                self.waiters.remove(entry.index);
                Err(RaftError::CommitTimeout {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                })
            }
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.state.id()
    }

    pub fn is_leader(&self) -> bool {
        self.state.role() == Role::Leader
    }

    pub fn role(&self) -> Role {
        self.state.role()
    }

    /// The leader this node currently believes in, if any.
    pub fn leader(&self) -> Option<ReplicaId> {
        self.state.leader()
    }

    pub fn current_term(&self) -> Term {
        self.state.current_term()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.commit_index()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.state.last_applied()
    }

    /// Direct access to the consensus state (tests and tooling).
    pub fn state(&self) -> &Arc<RaftState> {
        &self.state
    }

    /// Wait for a fatal background failure.
    ///
    /// A background task that cannot persist state it has acknowledged
    /// reports here and stops. The process should exit: continuing on
    /// untrustworthy storage risks contradicting promises already made
    /// to peers. Resolves at most once; never resolves on a healthy
    /// node.
    pub async fn wait_for_fatal(&self) -> RaftError {
        let mut rx = self.fatal_rx.lock().await;
        match rx.recv().await {
            Some(err) => err,
            // The node holds a sender, so the channel cannot close.
            None => std::future::pending().await,
        }
    }

    /// Stop all background tasks. Pending proposals fail with
    /// `LeadershipLost` as the apply loop drains.
    pub fn shutdown(&self) {
        tracing::info!(id = %self.state.id(), "replica shutting down");
        self.election_timer.shutdown();
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvCommand, KvReply, KvStore};
    use crate::transport::InMemoryTransport;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn single_node(dir: &TempDir) -> Node {
        let cluster =
            ClusterConfig::from_addrs(vec!["127.0.0.1:7001".parse().unwrap()]).unwrap();
        let transport: Arc<dyn RaftTransport> = Arc::new(InMemoryTransport::new(HashMap::new()));
        let (_rpc_tx, rpc_rx) = tokio::sync::mpsc::channel(64);
        let machine: Arc<tokio::sync::Mutex<dyn StateMachine>> =
            Arc::new(tokio::sync::Mutex::new(KvStore::new()));

        Node::open(
            ReplicaId(0),
            RaftConfig::fast(),
            cluster,
            dir.path(),
            transport,
            machine,
            rpc_rx,
        )
        .await
        .unwrap()
    }

    async fn wait_for_leadership(node: &Node) {
        for _ in 0..100 {
            if node.is_leader() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("node never became leader");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_node_commits_proposals() {
        let dir = TempDir::new().unwrap();
        let node = single_node(&dir).await;
        node.start().unwrap();

        wait_for_leadership(&node).await;

        let command = KvCommand::Create {
            key: "a".into(),
            value: "1".into(),
        };
        let reply = node.propose(command.encode().unwrap()).await.unwrap();
        assert_eq!(KvReply::decode(&reply).unwrap(), KvReply::Created);

        assert!(node.commit_index() >= LogIndex(1));
        assert!(node.last_applied() >= LogIndex(1));

        node.shutdown();
    }

    #[tokio::test]
    async fn test_propose_on_follower_is_not_leader() {
        let dir = TempDir::new().unwrap();
        let cluster = ClusterConfig::from_addrs(vec![
            "127.0.0.1:7001".parse().unwrap(),
            "127.0.0.1:7002".parse().unwrap(),
            "127.0.0.1:7003".parse().unwrap(),
        ])
        .unwrap();
        let transport: Arc<dyn RaftTransport> = Arc::new(InMemoryTransport::new(HashMap::new()));
        let (_rpc_tx, rpc_rx) = tokio::sync::mpsc::channel(64);
        let machine: Arc<tokio::sync::Mutex<dyn StateMachine>> =
            Arc::new(tokio::sync::Mutex::new(KvStore::new()));

        let node = Node::open(
            ReplicaId(0),
            RaftConfig::fast(),
            cluster,
            dir.path(),
            transport,
            machine,
            rpc_rx,
        )
        .await
        .unwrap();

        // Not started: still a follower with no leader hint.
        let err = node.propose(Bytes::from("x")).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { leader: None }));
    }

    #[tokio::test]
    async fn test_open_rejects_id_outside_cluster() {
        let dir = TempDir::new().unwrap();
        let cluster =
            ClusterConfig::from_addrs(vec!["127.0.0.1:7001".parse().unwrap()]).unwrap();
        let transport: Arc<dyn RaftTransport> = Arc::new(InMemoryTransport::new(HashMap::new()));
        let (_rpc_tx, rpc_rx) = tokio::sync::mpsc::channel(64);
        let machine: Arc<tokio::sync::Mutex<dyn StateMachine>> =
            Arc::new(tokio::sync::Mutex::new(KvStore::new()));

        let result = Node::open(
            ReplicaId(5),
            RaftConfig::fast(),
            cluster,
            dir.path(),
            transport,
            machine,
            rpc_rx,
        )
        .await;

        assert!(matches!(result.unwrap_err(), RaftError::Config { .. }));
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let dir = TempDir::new().unwrap();
        let node = single_node(&dir).await;

        node.start().unwrap();
        assert!(node.start().is_err());

        node.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_storage_failure_stops_the_node() {
        let dir = TempDir::new().unwrap();
        let cluster = ClusterConfig::from_addrs(vec![
            "127.0.0.1:7001".parse().unwrap(),
            "127.0.0.1:7002".parse().unwrap(),
        ])
        .unwrap();
        // No peers reachable: elections repeat forever, each persisting
        // a new term and vote.
        let transport: Arc<dyn RaftTransport> = Arc::new(InMemoryTransport::new(HashMap::new()));
        let (_rpc_tx, rpc_rx) = tokio::sync::mpsc::channel(64);
        let machine: Arc<tokio::sync::Mutex<dyn StateMachine>> =
            Arc::new(tokio::sync::Mutex::new(KvStore::new()));

        let node = Node::open(
            ReplicaId(0),
            RaftConfig::fast(),
            cluster,
            dir.path(),
            transport,
            machine,
            rpc_rx,
        )
        .await
        .unwrap();
        node.start().unwrap();

        // Pull the storage directory out from under the node; the next
        // term persist fails and must take the node down rather than
        // letting it keep voting with state it cannot record.
        std::fs::remove_dir_all(dir.path()).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(3), node.wait_for_fatal())
            .await
            .expect("storage failure was not reported");
        assert!(!err.is_retryable());

        node.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_state_survives_restart() {
        let dir = TempDir::new().unwrap();

        {
            let node = single_node(&dir).await;
            node.start().unwrap();
            wait_for_leadership(&node).await;

            let command = KvCommand::Create {
                key: "persisted".into(),
                value: "yes".into(),
            };
            node.propose(command.encode().unwrap()).await.unwrap();
            node.shutdown();
        }

        // Reopen from the same directory: the entry and term are back.
        let node = single_node(&dir).await;
        assert_eq!(node.state().store().last_index(), LogIndex(1));
        assert!(node.current_term() > Term::ZERO);
    }
}
