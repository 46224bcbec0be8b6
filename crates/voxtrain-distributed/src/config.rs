use crate::error::DistributedError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;

/// Environment variable listing every node, comma separated.
pub const NODES_ENV: &str = "VOXTRAIN_NODES";
/// Environment variable holding this node's rank.
pub const RANK_ENV: &str = "VOXTRAIN_RANK";

/// Configuration for distributed training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// List of all nodes in the cluster (IP:Port).
    /// The order must be consistent across all nodes.
    pub nodes: Vec<SocketAddr>,

    /// Rank of this node (index into nodes list).
    pub rank: usize,

    /// Connection timeout in milliseconds (default: 30000).
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Maximum connection retry attempts (default: 50).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_connection_timeout_ms() -> u64 {
    30000
}

fn default_max_retries() -> u32 {
    50
}

impl DistributedConfig {
    /// Create a new configuration.
    pub fn new(nodes: Vec<SocketAddr>, rank: usize) -> Self {
        Self {
            nodes,
            rank,
            connection_timeout_ms: default_connection_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }

    /// Read the cluster layout from `VOXTRAIN_NODES` and `VOXTRAIN_RANK`.
    ///
    /// Returns `Ok(None)` when `VOXTRAIN_NODES` is unset, which means a
    /// single-process run.
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(nodes) = std::env::var(NODES_ENV) else {
            return Ok(None);
        };
        let rank = std::env::var(RANK_ENV).unwrap_or_else(|_| "0".to_string());
        Self::parse(&nodes, &rank).map(Some)
    }

    /// Parse a comma-separated node list and a rank.
    pub fn parse(nodes: &str, rank: &str) -> Result<Self> {
        let nodes = nodes
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<SocketAddr>()
                    .map_err(|e| DistributedError::Config(format!("bad node address {s:?}: {e}")))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let rank = rank
            .trim()
            .parse::<usize>()
            .map_err(|e| DistributedError::Config(format!("bad rank {rank:?}: {e}")))?;

        let config = Self::new(nodes, rank);
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(DistributedError::Config("nodes list cannot be empty".to_string()).into());
        }

        if self.rank >= self.nodes.len() {
            return Err(DistributedError::Config(format!(
                "rank {} is out of bounds for {} nodes",
                self.rank,
                self.nodes.len()
            ))
            .into());
        }

        let unique: HashSet<_> = self.nodes.iter().collect();
        if unique.len() != self.nodes.len() {
            return Err(DistributedError::Config(
                "nodes list contains duplicate addresses".to_string(),
            )
            .into());
        }

        Ok(())
    }

    /// Get the world size (number of nodes).
    pub fn world_size(&self) -> usize {
        self.nodes.len()
    }

    /// Rank this node sends to in the ring.
    pub fn next_rank(&self) -> usize {
        (self.rank + 1) % self.world_size()
    }

    /// Rank this node receives from in the ring.
    pub fn prev_rank(&self) -> usize {
        (self.rank + self.world_size() - 1) % self.world_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nodes() {
        let cfg = DistributedConfig::parse("127.0.0.1:5000, 127.0.0.1:5001", "1").unwrap();
        assert_eq!(cfg.world_size(), 2);
        assert_eq!(cfg.rank, 1);
        assert_eq!(cfg.connection_timeout_ms, 30000);
    }

    #[test]
    fn test_ring_neighbours_wrap() {
        let cfg = DistributedConfig::parse("127.0.0.1:5000,127.0.0.1:5001,127.0.0.1:5002", "0")
            .unwrap();
        assert_eq!(cfg.next_rank(), 1);
        assert_eq!(cfg.prev_rank(), 2);
    }

    #[test]
    fn test_duplicate_nodes_rejected() {
        assert!(DistributedConfig::parse("127.0.0.1:5000,127.0.0.1:5000", "0").is_err());
    }

    #[test]
    fn test_rank_out_of_bounds() {
        assert!(DistributedConfig::parse("127.0.0.1:5000", "1").is_err());
    }

    #[test]
    fn test_duplicate_nodes() {
        assert!(DistributedConfig::parse("127.0.0.1:5000,127.0.0.1:5000", "0").is_err());
    }

    #[test]
    fn test_bad_address() {
        assert!(DistributedConfig::parse("localhost", "0").is_err());
        assert!(DistributedConfig::parse("127.0.0.1:5000", "x").is_err());
    }
}
