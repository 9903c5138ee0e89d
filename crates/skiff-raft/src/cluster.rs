//! Cluster membership configuration.
//!
//! All replicas load the same JSON file listing every replica's address;
//! a replica's ID is its position in that list. The file looks like:
//!
//! ```json
//! { "replicas": ["127.0.0.1:7001", "127.0.0.1:7002", "127.0.0.1:7003"] }
//! ```

use crate::error::{RaftError, Result};
use crate::types::ReplicaId;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct RawClusterConfig {
    replicas: Vec<String>,
}

/// Static cluster membership, shared by every replica.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    replicas: Vec<SocketAddr>,
}

impl ClusterConfig {
    /// Load and validate the cluster configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| RaftError::Config {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        let raw: RawClusterConfig =
            serde_json::from_str(&data).map_err(|e| RaftError::Config {
                reason: format!("malformed cluster config {}: {}", path.display(), e),
            })?;

        let mut replicas = Vec::with_capacity(raw.replicas.len());
        for addr in &raw.replicas {
            let resolved = addr
                .to_socket_addrs()
                .map_err(|e| RaftError::Config {
                    reason: format!("cannot resolve replica address {}: {}", addr, e),
                })?
                .next()
                .ok_or_else(|| RaftError::Config {
                    reason: format!("replica address {} resolved to nothing", addr),
                })?;
            replicas.push(resolved);
        }

        Self::from_addrs(replicas)
    }

    /// Build a configuration from already-resolved addresses.
    pub fn from_addrs(replicas: Vec<SocketAddr>) -> Result<Self> {
        if replicas.is_empty() {
            return Err(RaftError::Config {
                reason: "cluster config lists no replicas".to_string(),
            });
        }
        Ok(Self { replicas })
    }

    /// Number of replicas in the cluster.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Votes (or matching replicas) needed for a majority.
    pub fn majority(&self) -> usize {
        self.replicas.len() / 2 + 1
    }

    /// The address of a replica, if the ID is in range.
    pub fn addr(&self, id: ReplicaId) -> Option<SocketAddr> {
        self.replicas.get(id.as_u32() as usize).copied()
    }

    pub fn contains(&self, id: ReplicaId) -> bool {
        (id.as_u32() as usize) < self.replicas.len()
    }

    /// All replica IDs, in configuration order.
    pub fn replica_ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        (0..self.replicas.len() as u32).map(ReplicaId)
    }

    /// Every replica ID except `me`.
    pub fn peers(&self, me: ReplicaId) -> Vec<ReplicaId> {
        self.replica_ids().filter(|id| *id != me).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join("cluster.json");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_valid_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{ "replicas": ["127.0.0.1:7001", "127.0.0.1:7002", "127.0.0.1:7003"] }"#,
        );

        let config = ClusterConfig::load(&path).unwrap();
        assert_eq!(config.len(), 3);
        assert_eq!(config.majority(), 2);
        assert_eq!(
            config.addr(ReplicaId(1)).unwrap(),
            "127.0.0.1:7002".parse().unwrap()
        );
        assert!(config.addr(ReplicaId(3)).is_none());
    }

    #[test]
    fn test_peers_excludes_self() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{ "replicas": ["127.0.0.1:7001", "127.0.0.1:7002", "127.0.0.1:7003"] }"#,
        );

        let config = ClusterConfig::load(&path).unwrap();
        assert_eq!(config.peers(ReplicaId(0)), vec![ReplicaId(1), ReplicaId(2)]);
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "not json at all");

        let err = ClusterConfig::load(&path).unwrap_err();
        assert!(matches!(err, RaftError::Config { .. }));
    }

    #[test]
    fn test_empty_replica_list_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{ "replicas": [] }"#);

        assert!(ClusterConfig::load(&path).is_err());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = ClusterConfig::load("/nonexistent/cluster.json").unwrap_err();
        assert!(matches!(err, RaftError::Config { .. }));
    }

    #[test]
    fn test_majority_sizes() {
        for (n, want) in [(1usize, 1usize), (2, 2), (3, 2), (4, 3), (5, 3)] {
            let addrs = (0..n)
                .map(|i| format!("127.0.0.1:{}", 7001 + i).parse().unwrap())
                .collect();
            let config = ClusterConfig::from_addrs(addrs).unwrap();
            assert_eq!(config.majority(), want, "majority of {}", n);
        }
    }
}
