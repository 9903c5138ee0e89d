//! Raft consensus core.
//!
//! A single-group Raft implementation with durable state, leader
//! election, log replication, and a pluggable state machine:
//!
//! - [`store`]: fsync-before-respond log and term/vote storage
//! - [`state`]: the role state machine and RPC handlers
//! - [`election`] / [`timer`]: randomized-timeout leader election
//! - [`replication`]: leader-paced AppendEntries and commit advancement
//! - [`applier`]: strictly-ordered, exactly-once state machine apply
//! - [`transport`] / [`tcp`]: in-memory and TCP RPC transports
//! - [`node`]: the assembled replica with the `propose` client path
//! - [`kv`]: a replicated key-value state machine
//!
//! # Safety properties
//!
//! At most one leader per term (votes are durable and one-per-term);
//! committed entries survive leader changes (vote rule + commit rule);
//! state machines apply the same commands in the same order everywhere.

pub mod applier;
pub mod cluster;
pub mod config;
pub mod election;
pub mod error;
pub mod kv;
pub mod node;
pub mod replication;
pub mod rpc_handler;
pub mod state;
pub mod store;
pub mod tcp;
pub mod timer;
pub mod transport;
pub mod types;

pub use applier::{CommitWaiters, StateMachine};
pub use cluster::ClusterConfig;
pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use kv::{KvCommand, KvReply, KvStore};
pub use node::Node;
pub use state::RaftState;
pub use store::{HardState, LogStore};
pub use tcp::TcpTransport;
pub use timer::ElectionTimer;
pub use transport::{InMemoryTransport, RaftTransport, RpcMessage, RpcReceiver, RpcSender};
pub use types::{
    AppendEntriesRequest, AppendEntriesResponse, EntryKind, LogEntry, LogIndex, ReplicaId,
    RequestVoteRequest, RequestVoteResponse, Role, Term,
};
