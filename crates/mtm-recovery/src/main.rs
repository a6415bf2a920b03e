//! MTM Recovery - partition/recovery check for a live multimaster cluster
//!
//! Runs the bank-transfer workload against every node, partitions one node
//! away with the configured tool, heals it, and exits non-zero unless the
//! majority kept committing and the isolated node came back.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use mtm_harness::{HarnessConfig, HarnessContext, NodeEndpoint, PartitionRecoveryScenario};

#[derive(Parser)]
#[command(name = "mtm-recovery")]
#[command(about = "Partition a multimaster node and check that the cluster recovers")]
struct Args {
    /// JSON configuration file (defaults: 3 local nodes on ports 5432-5434)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Node connection string, repeatable; nodes are named node1, node2, ...
    #[arg(long = "node", value_name = "CONNINFO")]
    nodes: Vec<String>,

    /// 1-based number of the node to partition (default: last node)
    #[arg(long)]
    target: Option<usize>,

    /// Wait after starting the workload
    #[arg(long, value_parser = humantime::parse_duration)]
    warmup: Option<Duration>,

    /// Wait between polling rounds
    #[arg(long, value_parser = humantime::parse_duration)]
    poll_interval: Option<Duration>,

    /// Polling rounds while partitioned
    #[arg(long)]
    partition_rounds: Option<usize>,

    /// Polling rounds after healing
    #[arg(long)]
    heal_rounds: Option<usize>,

    /// Partition tool program
    #[arg(long)]
    tool: Option<String>,

    /// Skip recreating the bank table
    #[arg(long)]
    no_prepare: bool,

    /// Print the report as JSON on success
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Args {
    fn into_config(self) -> anyhow::Result<(HarnessConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => HarnessConfig::default(),
        };

        if !self.nodes.is_empty() {
            config.nodes = self
                .nodes
                .iter()
                .enumerate()
                .map(|(i, conninfo)| NodeEndpoint::from_conninfo(format!("node{}", i + 1), conninfo))
                .collect::<Result<_, _>>()?;
            config.scenario.target_node = config.nodes.len() - 1;
        }
        if let Some(target) = self.target {
            config.scenario.target_node = target
                .checked_sub(1)
                .context("Node numbers start at 1")?;
        }
        if let Some(warmup) = self.warmup {
            config.scenario.warmup_ms = millis(warmup);
        }
        if let Some(interval) = self.poll_interval {
            config.scenario.poll_interval_ms = millis(interval);
        }
        if let Some(rounds) = self.partition_rounds {
            config.scenario.partition_rounds = rounds;
        }
        if let Some(rounds) = self.heal_rounds {
            config.scenario.heal_rounds = rounds;
        }
        if let Some(tool) = self.tool {
            config.partition_tool.program = tool;
        }
        if self.no_prepare {
            config.workload.prepare_schema = false;
        }
        Ok((config, self.json))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (config, json) = args.into_config()?;
    config.validate()?;
    for (i, node) in config.nodes.iter().enumerate() {
        info!("Node {}: {}", i + 1, node);
    }
    info!(
        "Target: {}, {} partition rounds and {} heal rounds every {}",
        config.nodes[config.scenario.target_node].name,
        config.scenario.partition_rounds,
        config.scenario.heal_rounds,
        humantime::format_duration(config.scenario.poll_interval()),
    );

    let context = HarnessContext::postgres(config)?;
    let mut scenario = PartitionRecoveryScenario::new(context);

    match scenario.run().await {
        Ok(report) => {
            info!("Cluster recovered after partitioning {}", report.target);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Ok(())
        }
        Err(e) => {
            error!("{:?} failure: {}", e.category(), e);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from([
            "mtm-recovery",
            "--node",
            "host=db1 port=5432",
            "--node",
            "host=db2 port=5432",
            "--target",
            "1",
            "--poll-interval",
            "250ms",
            "--warmup",
            "2s",
        ])
        .unwrap();
        let (config, json) = args.into_config().unwrap();

        assert!(!json);
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[1].host, "db2");
        assert_eq!(config.scenario.target_node, 0);
        assert_eq!(config.scenario.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.scenario.warmup(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }
}
