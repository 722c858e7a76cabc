//! Daemon configuration persisted through `Settings<NodeConfig>`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use stakenode_core::NodeAddress;
use stakenode_logging::LogLevel;
use stakenode_minipool::{FanOut, PipelineConfig};
use stakenode_settings::Validate;
use stakenode_watchtower::WatchtowerConfig;

use crate::AppError;

/// Period of a recurring task, stored in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduled runs.
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

impl SchedulerConfig {
    /// Never shorter than one second.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Everything the node daemon reads from its settings file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// The node account. Must be set before the daemon can start.
    pub node_address: Option<NodeAddress>,
    /// Used unless `RUST_LOG` or the command line says otherwise.
    pub log_level: LogLevel,
    /// Schedule of the node's own staking duty.
    pub node_operator: SchedulerConfig,
    /// Trust polling and cycle period of the watchtower duty.
    pub watchtower: WatchtowerConfig,
    /// Shared by both duties.
    pub pipeline: PipelineConfig,
}

impl Validate for NodeConfig {
    fn validate(&self) -> Result<(), String> {
        if self.node_operator.interval_secs == 0 {
            return Err("node_operator.interval_secs must be positive".to_string());
        }
        if self.watchtower.cycle_interval_secs == 0 {
            return Err("watchtower.cycle_interval_secs must be positive".to_string());
        }
        if self.watchtower.trust_poll_interval_secs == 0 {
            return Err("watchtower.trust_poll_interval_secs must be positive".to_string());
        }
        if self.pipeline.fan_out == FanOut::Bounded(0) {
            return Err("pipeline.fan_out must allow at least one query".to_string());
        }
        Ok(())
    }
}

impl NodeConfig {
    /// The configured node address.
    pub fn node(&self) -> Result<NodeAddress, AppError> {
        self.node_address.ok_or(AppError::MissingNodeAddress)
    }
}
