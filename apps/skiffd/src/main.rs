//! skiffd: one replica of the replicated key-value store.
//!
//! Every replica is launched with the same cluster configuration file;
//! the replica index selects which entry is "us". The storage directory
//! must already exist and belong exclusively to this replica.
//!
//! ```text
//! skiffd cluster.json 0 /var/lib/skiff/r0
//! ```

use clap::Parser;
use skiff_raft::{
    tcp, ClusterConfig, KvStore, Node, RaftConfig, RaftTransport, ReplicaId, StateMachine,
    TcpTransport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skiffd", about = "Replicated key-value store node")]
struct Args {
    /// Path to the cluster configuration JSON
    config: PathBuf,

    /// This replica's index into the configuration's replica list
    replica: u32,

    /// Storage directory for this replica (must already exist)
    storage: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let id = ReplicaId(args.replica);

    let cluster = ClusterConfig::load(&args.config)?;
    let listen_addr = cluster
        .addr(id)
        .ok_or_else(|| format!("replica {} is not in {}", id, args.config.display()))?;

    tracing::info!(%id, addr = %listen_addr, config = %args.config.display(), "starting replica");

    // Inbound RPC traffic flows listener -> channel -> node.
    let listener = TcpListener::bind(listen_addr).await?;
    let (rpc_tx, rpc_rx) = tokio::sync::mpsc::channel(1024);
    let (net_shutdown_tx, net_shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(tcp::serve(listener, rpc_tx, net_shutdown_rx));

    let transport: Arc<dyn RaftTransport> = Arc::new(TcpTransport::new(cluster.clone()));
    let machine: Arc<tokio::sync::Mutex<dyn StateMachine>> =
        Arc::new(tokio::sync::Mutex::new(KvStore::new()));

    let node = Node::open(
        id,
        RaftConfig::default(),
        cluster,
        &args.storage,
        transport,
        machine,
        rpc_rx,
    )
    .await?;
    node.start()?;

    tracing::info!(%id, "replica ready");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("received shutdown signal, shutting down");
            node.shutdown();
            let _ = net_shutdown_tx.send(());
            Ok(())
        }
        err = node.wait_for_fatal() => {
            // Storage the node has made promises against is gone or
            // broken. Exit non-zero so the supervisor restarts us into
            // recovery instead of letting a lying replica keep running.
            tracing::error!(error = %err, "fatal storage failure, exiting");
            node.shutdown();
            let _ = net_shutdown_tx.send(());
            Err(err.into())
        }
    }
}
