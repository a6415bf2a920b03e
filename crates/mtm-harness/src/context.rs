//! Per-run harness context
//!
//! Everything a scenario touches is built once here and owned by the
//! context: endpoints, the counter store, the workload driver and the
//! partition controller. There is no global client.

use std::sync::Arc;

use crate::aggregator::StatusAggregator;
use crate::config::HarnessConfig;
use crate::endpoint::NodeEndpoint;
use crate::error::Result;
use crate::partition::{CommandPartitionTool, PartitionController, PartitionTool};
use crate::postgres::PgConnector;
use crate::workload::{Connector, WorkloadDriver};

/// Components of one harness run
pub struct HarnessContext {
    config: HarnessConfig,
    aggregator: Arc<StatusAggregator>,
    workload: WorkloadDriver,
    partitions: PartitionController,
}

impl HarnessContext {
    /// Build a context from explicit collaborators
    pub fn new(
        config: HarnessConfig,
        connector: Arc<dyn Connector>,
        tool: Arc<dyn PartitionTool>,
    ) -> Result<Self> {
        config.validate()?;
        let aggregator = Arc::new(StatusAggregator::new());
        let workload = WorkloadDriver::new(
            config.nodes.clone(),
            connector,
            aggregator.clone(),
            config.workload.clone(),
        );
        Ok(Self {
            config,
            aggregator,
            workload,
            partitions: PartitionController::new(tool),
        })
    }

    /// Context talking to real Postgres nodes and the configured partition tool
    pub fn postgres(config: HarnessConfig) -> Result<Self> {
        let connector = Arc::new(
            PgConnector::new(config.workload.connect_timeout())
                .with_extension(config.workload.extension.clone()),
        );
        let tool = Arc::new(CommandPartitionTool::new(config.partition_tool.clone()));
        Self::new(config, connector, tool)
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn nodes(&self) -> &[NodeEndpoint] {
        &self.config.nodes
    }

    pub fn aggregator(&self) -> &StatusAggregator {
        &self.aggregator
    }

    pub fn workload(&mut self) -> &mut WorkloadDriver {
        &mut self.workload
    }

    pub fn partitions(&self) -> &PartitionController {
        &self.partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;
    use crate::test_utils::{InMemoryCluster, ScriptedPartitionTool};

    #[test]
    fn test_invalid_config_is_rejected() {
        let cluster = InMemoryCluster::new(1);
        let mut config = HarnessConfig::local_cluster(1);
        config.nodes = cluster.endpoints();

        let result = HarnessContext::new(
            config,
            Arc::new(cluster.connector()),
            Arc::new(ScriptedPartitionTool::new()),
        );
        assert!(matches!(result, Err(HarnessError::Config(_))));
    }

    #[test]
    fn test_postgres_context_builds_without_connecting() {
        let context = HarnessContext::postgres(HarnessConfig::default()).unwrap();
        assert_eq!(context.nodes().len(), 3);
        assert!(context.aggregator().snapshot().is_empty());
    }
}
