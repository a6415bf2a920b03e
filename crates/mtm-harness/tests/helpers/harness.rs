//! TestHarness - in-memory cluster wired into a harness context
//!
//! Timings are scaled down from the production defaults (seconds to tens of
//! milliseconds) so a full partition/heal scenario runs in well under a
//! second while every task still completes plenty of transactions per round.

use std::sync::Arc;
use std::time::Duration;

use mtm_harness::test_utils::{InMemoryCluster, ScriptedPartitionTool};
use mtm_harness::{HarnessConfig, HarnessContext, PartitionRecoveryScenario};

/// Install a test subscriber once per process
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("mtm_harness=debug")
        .with_test_writer()
        .try_init();
}

/// Scenario configuration with millisecond timings
pub fn fast_config(cluster: &InMemoryCluster) -> HarnessConfig {
    let mut config = HarnessConfig::local_cluster(cluster.endpoints().len());
    config.nodes = cluster.endpoints();
    config.workload.accounts = 1_000;
    config.workload.reconnect_delay_ms = 5;
    config.scenario.warmup_ms = 30;
    config.scenario.poll_interval_ms = 40;
    config.scenario.partition_rounds = 3;
    config.scenario.heal_rounds = 5;
    config.scenario.teardown_timeout_ms = 2_000;
    config
}

/// In-memory cluster plus the doubles driving it
pub struct TestHarness {
    pub cluster: InMemoryCluster,
    pub tool: Arc<ScriptedPartitionTool>,
}

impl TestHarness {
    /// Cluster of `count` nodes with a partition tool bound to it
    pub fn new(count: usize) -> Self {
        Self::from_cluster(InMemoryCluster::new(count))
    }

    pub fn from_cluster(cluster: InMemoryCluster) -> Self {
        let tool = Arc::new(ScriptedPartitionTool::for_cluster(&cluster));
        Self { cluster, tool }
    }

    pub fn context(&self, config: HarnessConfig) -> HarnessContext {
        HarnessContext::new(config, Arc::new(self.cluster.connector()), self.tool.clone())
            .expect("Failed to build harness context")
    }

    pub fn scenario(&self) -> PartitionRecoveryScenario {
        PartitionRecoveryScenario::new(self.context(fast_config(&self.cluster)))
    }

    pub fn scenario_with(&self, configure: impl FnOnce(&mut HarnessConfig)) -> PartitionRecoveryScenario {
        let mut config = fast_config(&self.cluster);
        configure(&mut config);
        PartitionRecoveryScenario::new(self.context(config))
    }
}

/// Sleep helper mirroring the scenario cadence
pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
