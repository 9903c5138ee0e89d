//! Randomized election timer.
//!
//! Counts down a randomized timeout and announces expiry on a broadcast
//! channel. Every valid heartbeat or granted vote resets the countdown
//! with a fresh random duration, which is what keeps simultaneous
//! candidacies (and the split votes they cause) rare.

use crate::config::RaftConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, Notify};

pub struct ElectionTimer {
    config: RaftConfig,
    reset_notify: Notify,
    stop_notify: Notify,
    stopped: AtomicBool,
    timeout_tx: broadcast::Sender<()>,
}

impl ElectionTimer {
    pub fn new(config: RaftConfig) -> Self {
        let (timeout_tx, _) = broadcast::channel(16);
        Self {
            config,
            reset_notify: Notify::new(),
            stop_notify: Notify::new(),
            stopped: AtomicBool::new(false),
            timeout_tx,
        }
    }

    /// Subscribe to timeout expiries. Each recv is one elapsed timeout.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.timeout_tx.subscribe()
    }

    /// Restart the countdown with a fresh random duration.
    pub fn reset(&self) {
        self.reset_notify.notify_one();
    }

    /// Stop the timer permanently.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
    }

    /// The timer loop. Runs until shutdown.
    pub async fn run(&self) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            let timeout = self.config.random_election_timeout();
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    // No subscribers just means nobody cares yet.
                    let _ = self.timeout_tx.send(());
                }
                _ = self.reset_notify.notified() => {}
                _ = self.stop_notify.notified() => break,
            }
        }
    }
}
