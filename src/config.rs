//! Config loading and defaults.
//!
//! All durations are expressed in microseconds to match the wire protocol
//! and the record key timestamps.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Record log path; the in-flight companion file lives beside it.
    pub database: String,
    /// How long to wait for a consumer ACK before a message becomes
    /// eligible for redelivery (microseconds).
    pub ack_timeout: u64,
    /// How often the reaper sweeps expired in-flight entries (microseconds).
    pub reaper_frequency: u64,
    /// How often the store is flushed to disk (microseconds).
    pub sync_frequency: u64,
    /// Flush with fsync on every sync.
    pub hard_sync: bool,
    /// Byte cap for the in-flight index; oldest entries are evicted when full.
    pub inflight_size: u64,
    /// Producer-facing router socket address.
    pub receive_addr: String,
    /// Consumer-facing streaming socket address.
    pub send_addr: String,
    /// Monitoring router socket address.
    pub monitor_addr: String,
    pub cluster: ClusterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: "/tmp/duraq.log".to_string(),
            ack_timeout: 5_000_000,
            reaper_frequency: 2_500_000,
            sync_frequency: 2_500_000,
            hard_sync: false,
            inflight_size: 31_457_280,
            receive_addr: "127.0.0.1:11131".to_string(),
            send_addr: "127.0.0.1:11132".to_string(),
            monitor_addr: "127.0.0.1:11133".to_string(),
            cluster: ClusterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Name this node announces in keepalives. Empty disables clustering.
    pub node_name: String,
    /// Replica acks required before the producer is acked.
    pub replicas: u32,
    /// Statically configured peer nodes.
    pub peers: Vec<PeerConfig>,
    /// How long a missing keepalive marks a node stale (microseconds).
    pub timeout_nodes: u64,
    /// How long to wait for the replica quorum (microseconds).
    pub timeout_replication: u64,
    /// Address to publish cluster control frames on.
    pub broadcast_addr: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            replicas: 0,
            peers: Vec::new(),
            timeout_nodes: 10_000_000,
            timeout_replication: 5_000_000,
            broadcast_addr: "127.0.0.1:11134".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Node name as announced in its keepalives.
    pub name: String,
    /// The peer's producer-facing address (replicas are written there).
    pub addr: String,
    /// The peer's broadcast address (subscribed for control frames).
    pub broadcast_addr: String,
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_standalone() {
        let config = Config::default();
        assert_eq!(config.cluster.replicas, 0);
        assert!(config.cluster.peers.is_empty());
        assert_eq!(config.ack_timeout, 5_000_000);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            database = "/var/lib/duraq/broker.log"

            [cluster]
            node_name = "node-a"
            replicas = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.database, "/var/lib/duraq/broker.log");
        assert_eq!(config.cluster.replicas, 2);
        assert_eq!(config.ack_timeout, 5_000_000);
        assert_eq!(config.cluster.timeout_nodes, 10_000_000);
    }
}
