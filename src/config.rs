use crate::consensus::ConsensusConfig;
use crate::node::NodeOptions;
use crate::pacemaker::PacemakerConfig;
use crate::state_sync::StateSyncConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// On-disk node configuration. Every field has a default, so `{}` is a valid file
/// describing node 0 of a four-validator devnet.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfig {
    /// Seed for this node's deterministic key.
    pub node_id: u64,
    /// Validators are the keys of ids `0..validator_count`.
    pub validator_count: u64,
    /// 0 picks a free port.
    pub listen_port: u16,
    pub bootnodes: Vec<String>,
    pub rpc_port: u16,
    /// `None` keeps blocks in memory.
    pub db_path: Option<String>,
    pub timeout_ms: u64,
    pub manual_mode: bool,
    pub debug_interval_ms: u64,
    pub sync_interval_ms: u64,
    pub retention_floor: u64,
    pub max_in_flight: usize,
    pub max_block_transactions: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            validator_count: 4,
            listen_port: 9000,
            bootnodes: Vec::new(),
            rpc_port: 8545,
            db_path: Some("./db/node_0".to_string()),
            timeout_ms: 2000,
            manual_mode: false,
            debug_interval_ms: 0,
            sync_interval_ms: 1000,
            retention_floor: 1,
            max_in_flight: 4,
            max_block_transactions: 500,
        }
    }
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.validator_count == 0 {
            return Err(ConfigError::Invalid("validator_count must be positive".into()));
        }
        if self.node_id >= self.validator_count {
            return Err(ConfigError::Invalid(format!(
                "node_id {} is outside 0..{}",
                self.node_id, self.validator_count
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be positive".into()));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid("max_in_flight must be positive".into()));
        }
        Ok(())
    }

    pub fn consensus(&self) -> ConsensusConfig {
        ConsensusConfig {
            pacemaker: PacemakerConfig {
                timeout: Duration::from_millis(self.timeout_ms),
                manual_mode: self.manual_mode,
                debug_interval: Duration::from_millis(self.debug_interval_ms),
            },
            state_sync: StateSyncConfig {
                retention_floor: self.retention_floor,
                max_in_flight: self.max_in_flight,
                ..StateSyncConfig::default()
            },
            max_block_transactions: self.max_block_transactions,
        }
    }

    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            sync_interval: Duration::from_millis(self.sync_interval_ms.max(1)),
            ..NodeOptions::default()
        }
    }
}
