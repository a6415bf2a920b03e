//! Harness configuration types

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::endpoint::NodeEndpoint;
use crate::error::{HarnessError, Result};

/// Full configuration of one harness run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Cluster members, in node-index order
    pub nodes: Vec<NodeEndpoint>,
    /// Workload settings
    pub workload: WorkloadConfig,
    /// External partition tool
    pub partition_tool: PartitionToolConfig,
    /// Scenario timing
    pub scenario: ScenarioConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::local_cluster(3)
    }
}

impl HarnessConfig {
    /// Conventional local layout: `node1..nodeN` on ports 5432, 5433, ...
    pub fn local_cluster(count: usize) -> Self {
        let nodes = (0..count)
            .map(|i| NodeEndpoint::new(format!("node{}", i + 1), "127.0.0.1", 5432 + i as u16))
            .collect();
        Self {
            nodes,
            workload: WorkloadConfig::default(),
            partition_tool: PartitionToolConfig::default(),
            scenario: ScenarioConfig {
                target_node: count.saturating_sub(1),
                ..ScenarioConfig::default()
            },
        }
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Reject configurations the scenario cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.nodes.len() < 2 {
            return Err(HarnessError::Config(format!(
                "Need at least 2 nodes, got {}",
                self.nodes.len()
            )));
        }
        if self.scenario.target_node >= self.nodes.len() {
            return Err(HarnessError::Config(format!(
                "Target node index {} out of range (0..{})",
                self.scenario.target_node,
                self.nodes.len()
            )));
        }
        if self.scenario.partition_rounds == 0 || self.scenario.heal_rounds == 0 {
            return Err(HarnessError::Config("Polling round counts must be positive".into()));
        }
        if self.workload.accounts < 2 {
            return Err(HarnessError::Config("Need at least 2 accounts".into()));
        }
        if i32::try_from(self.workload.accounts).is_err() {
            return Err(HarnessError::Config(format!(
                "At most {} accounts fit the bank table, got {}",
                i32::MAX,
                self.workload.accounts
            )));
        }
        Ok(())
    }
}

/// Workload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadConfig {
    /// Number of rows in the bank table
    pub accounts: u32,
    /// Run the sum-total isolation probe next to transfers
    pub check_totals: bool,
    /// Recreate the bank table before starting
    pub prepare_schema: bool,
    /// Extension to create on the first node before the bank table, for
    /// clusters that are not provisioned with it
    pub extension: Option<String>,
    /// Pause before reconnecting a failed session, in milliseconds
    pub reconnect_delay_ms: u64,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            accounts: 100_000,
            check_totals: true,
            prepare_schema: true,
            extension: None,
            reconnect_delay_ms: 500,
            connect_timeout_secs: 5,
        }
    }
}

impl WorkloadConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// External partition tool invocation
///
/// `{node}` in `partition_args` is replaced with the target node name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartitionToolConfig {
    pub program: String,
    pub partition_args: Vec<String>,
    pub heal_args: Vec<String>,
}

impl Default for PartitionToolConfig {
    fn default() -> Self {
        Self {
            program: "blockade".to_string(),
            partition_args: vec!["partition".to_string(), "{node}".to_string()],
            heal_args: vec!["join".to_string()],
        }
    }
}

/// Scenario timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Index of the node to isolate
    pub target_node: usize,
    /// Wait after starting the workload, in milliseconds
    pub warmup_ms: u64,
    /// Wait between polling rounds, in milliseconds
    pub poll_interval_ms: u64,
    /// Rounds asserted while partitioned
    pub partition_rounds: usize,
    /// Convergence rounds after healing; only the last one is judged
    pub heal_rounds: usize,
    /// Time allowed for workload tasks to stop, in milliseconds
    pub teardown_timeout_ms: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            target_node: 2,
            warmup_ms: 5_000,
            poll_interval_ms: 3_000,
            partition_rounds: 3,
            heal_rounds: 20,
            teardown_timeout_ms: 10_000,
        }
    }
}

impl ScenarioConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}
