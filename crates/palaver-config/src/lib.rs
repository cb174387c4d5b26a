//! Configuration management for Palaver
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (`PALAVER_*` prefix, highest precedence)
//! 2. `palaver.toml` in the working directory (or an explicit path)
//! 3. Built-in defaults (lowest precedence)
//!
//! Validation enforces the timing relations the consensus protocol
//! assumes: the election timeout window must be real, and heartbeats must
//! fit well inside it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

/// Main Palaver node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PalaverConfig {
    pub node: NodeConfig,
    pub raft: RaftTimingConfig,
    pub snapshot: SnapshotConfig,
    pub cluster: ClusterTableConfig,
}

impl Default for PalaverConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            raft: RaftTimingConfig::default(),
            snapshot: SnapshotConfig::default(),
            cluster: ClusterTableConfig::default(),
        }
    }
}

/// Identity and local resources of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's id; must appear in `cluster.members`.
    pub id: u64,
    /// Address to listen on for clients and peers.
    pub listen_addr: String,
    /// Durable-store root.
    pub data_directory: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 0,
            listen_addr: "127.0.0.1:7400".to_string(),
            data_directory: PathBuf::from(".palaver/data"),
        }
    }
}

/// Consensus timing, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftTimingConfig {
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max_ms: u64,
    /// Leader heartbeat interval; must be well under the election minimum.
    pub heartbeat_interval_ms: u64,
    /// Per-request deadline for client writes.
    pub request_timeout_ms: u64,
    /// Flow-control cap on entries per append.
    pub max_entries_per_append: usize,
}

impl Default for RaftTimingConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 400,
            election_timeout_max_ms: 800,
            heartbeat_interval_ms: 150,
            request_timeout_ms: 5_000,
            max_entries_per_append: 128,
        }
    }
}

/// Snapshot and membership catch-up tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Log entry count that triggers a capture.
    pub log_threshold: usize,
    /// Stream chunk size in bytes.
    pub chunk_size: usize,
    /// How close (in entries) a learner must trail before promotion.
    pub promotion_lag: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            log_threshold: 4096,
            chunk_size: 64 * 1024,
            promotion_lag: 0,
        }
    }
}

/// One row of the static bootstrap membership table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEntry {
    pub id: u64,
    pub addr: String,
}

/// The initial cluster membership.
///
/// Only consulted on first boot; after that, membership lives in the
/// replicated state and the durable metadata record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterTableConfig {
    pub members: Vec<MemberEntry>,
}

impl PalaverConfig {
    /// Checks the relations between settings that the protocol assumes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let raft = &self.raft;
        if raft.election_timeout_min_ms == 0
            || raft.election_timeout_min_ms >= raft.election_timeout_max_ms
        {
            return Err(ConfigError::Validation(format!(
                "election timeout window [{}, {}] ms is empty",
                raft.election_timeout_min_ms, raft.election_timeout_max_ms
            )));
        }
        if raft.heartbeat_interval_ms * 2 > raft.election_timeout_min_ms {
            return Err(ConfigError::Validation(format!(
                "heartbeat interval {} ms must be under half the election minimum {} ms",
                raft.heartbeat_interval_ms, raft.election_timeout_min_ms
            )));
        }
        if self.cluster.members.is_empty() {
            return Err(ConfigError::Validation(
                "cluster.members must not be empty".to_string(),
            ));
        }
        if !self.cluster.members.iter().any(|m| m.id == self.node.id) {
            return Err(ConfigError::Validation(format!(
                "node id {} is not in cluster.members",
                self.node.id
            )));
        }
        let mut ids: Vec<u64> = self.cluster.members.iter().map(|m| m.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.cluster.members.len() {
            return Err(ConfigError::Validation(
                "cluster.members contains duplicate ids".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> PalaverConfig {
        PalaverConfig {
            cluster: ClusterTableConfig {
                members: vec![MemberEntry {
                    id: 0,
                    addr: "127.0.0.1:7400".into(),
                }],
            },
            ..PalaverConfig::default()
        }
    }

    #[test]
    fn default_with_self_member_validates() {
        valid().validate().unwrap();
    }

    #[test]
    fn empty_timeout_window_rejected() {
        let mut config = valid();
        config.raft.election_timeout_min_ms = 800;
        config.raft.election_timeout_max_ms = 800;
        assert!(config.validate().is_err());
    }

    #[test]
    fn slow_heartbeat_rejected() {
        let mut config = valid();
        config.raft.heartbeat_interval_ms = 300;
        config.raft.election_timeout_min_ms = 400;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_self_rejected() {
        let mut config = valid();
        config.node.id = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_member_ids_rejected() {
        let mut config = valid();
        config.cluster.members.push(MemberEntry {
            id: 0,
            addr: "127.0.0.1:7401".into(),
        });
        assert!(config.validate().is_err());
    }
}
