//! RPC handler loop for processing incoming Raft RPCs.
//!
//! This module provides the dispatcher that bridges the transport layer
//! (which receives RPC messages) to the RaftState handlers (which process them).
//!
//! # Architecture
//!
//! ```text
//! Transport receives RPC -> RpcMessage enum -> rpc_handler_loop
//!     |
//! Match on message type -> Call RaftState::handle_XXX
//!     |
//! Send response back via oneshot channel
//! ```

use crate::error::{RaftError, Result};
use crate::state::RaftState;
use crate::timer::ElectionTimer;
use crate::transport::{RpcMessage, RpcReceiver};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// RPC handler loop.
///
/// Continuously receives RPC messages from the transport and dispatches them
/// to the appropriate handler methods in RaftState.
///
/// The loop exits when either:
/// - Shutdown signal is received
/// - RPC receiver channel is closed (transport gone)
/// - A handler hits a fatal storage failure (reported on `fatal_tx`)
pub async fn rpc_handler_loop(
    state: Arc<RaftState>,
    mut rpc_rx: RpcReceiver,
    election_timer: Arc<ElectionTimer>,
    fatal_tx: mpsc::Sender<RaftError>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            msg_opt = rpc_rx.recv() => {
                match msg_opt {
                    Some(msg) => {
                        if let Err(e) = handle_rpc_message(&state, &election_timer, msg).await {
                            tracing::error!(error = %e, "storage failure handling RPC, stopping");
                            let _ = fatal_tx.try_send(e);
                            break;
                        }
                    }
                    None => {
                        tracing::debug!("RPC channel closed, exiting handler loop");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("RPC handler loop shutting down");
                break;
            }
        }
    }
}

/// Dispatch a single RPC message to the appropriate handler.
///
/// Sends the response back via the oneshot channel. A handler error is
/// a storage failure and is propagated: the node must stop rather than
/// keep responding with state it could not persist. The caller's RPC
/// times out, which it already handles like a lost packet.
async fn handle_rpc_message(
    state: &Arc<RaftState>,
    election_timer: &Arc<ElectionTimer>,
    msg: RpcMessage,
) -> Result<()> {
    match msg {
        RpcMessage::RequestVote {
            request,
            response_tx,
        } => {
            let resp = state.handle_request_vote(request).await?;
            // A granted vote restarts the countdown: we just told
            // someone else to go be leader.
            if resp.vote_granted {
                election_timer.reset();
            }
            let _ = response_tx.send(resp);
        }

        RpcMessage::AppendEntries {
            request,
            response_tx,
        } => {
            let request_term = request.term;
            let resp = state.handle_append_entries(request).await?;
            // Any traffic from the current term's leader proves it is
            // alive, including a failed consistency check while it
            // backtracks our log. A stale leader (resp.term higher than
            // what it sent) does not count.
            if resp.term == request_term {
                election_timer.reset();
            }
            let _ = response_tx.send(resp);
        }
    }
    Ok(())
}
