//! Raft timing and batching configuration.

use rand::Rng;
use std::time::Duration;

/// Tunable parameters for a single Raft node.
///
/// The invariants that matter: the heartbeat interval must be well below
/// the minimum election timeout (or followers will keep calling elections
/// under a healthy leader), and election timeouts must be randomized so
/// that split votes resolve quickly.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between leader heartbeats.
    pub heartbeat_interval: Duration,

    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: Duration,

    /// Upper bound of the randomized election timeout.
    pub election_timeout_max: Duration,

    /// Per-RPC timeout for votes and AppendEntries.
    pub rpc_timeout: Duration,

    /// How long a proposal waits for commit before timing out.
    pub propose_timeout: Duration,

    /// How often the apply loop checks for newly committed entries.
    pub apply_interval: Duration,

    /// Maximum entries per AppendEntries request.
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            rpc_timeout: Duration::from_millis(100),
            propose_timeout: Duration::from_secs(5),
            apply_interval: Duration::from_millis(10),
            max_entries_per_append: 1000,
        }
    }
}

impl RaftConfig {
    /// Timings compressed for tests: fast elections, fast apply ticks.
    pub fn fast() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(30),
            election_timeout_min: Duration::from_millis(100),
            election_timeout_max: Duration::from_millis(200),
            rpc_timeout: Duration::from_millis(50),
            propose_timeout: Duration::from_secs(2),
            apply_interval: Duration::from_millis(5),
            max_entries_per_append: 1000,
        }
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(format!(
                "election_timeout_min ({:?}) must be < election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(format!(
                "heartbeat_interval ({:?}) must be < election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }
        if self.max_entries_per_append == 0 {
            return Err("max_entries_per_append must be > 0".to_string());
        }
        Ok(())
    }

    /// A fresh randomized election timeout in `[min, max)`.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RaftConfig::default().validate().is_ok());
        assert!(RaftConfig::fast().validate().is_ok());
    }

    #[test]
    fn test_invalid_timeout_ordering() {
        let config = RaftConfig {
            election_timeout_min: Duration::from_millis(600),
            election_timeout_max: Duration::from_millis(300),
            ..RaftConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_must_beat_election_timeout() {
        let config = RaftConfig {
            heartbeat_interval: Duration::from_millis(400),
            ..RaftConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_random_election_timeout_in_range() {
        let config = RaftConfig::default();
        for _ in 0..100 {
            let t = config.random_election_timeout();
            assert!(t >= config.election_timeout_min);
            assert!(t < config.election_timeout_max);
        }
    }
}
