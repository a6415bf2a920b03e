//! Partition/recovery scenario
//!
//! Sequences the test as a small state machine:
//!
//! ```text
//! Idle -> WorkloadRunning -> Partitioned -> Healed -> Stopped
//! ```
//!
//! While partitioned, every node outside the partition must commit in every
//! polling round. After healing, the cluster gets a convergence window and
//! only the last round is judged: every node, the rejoined one included,
//! must have committed. Whatever happens, the run ends in teardown: heal
//! once if the topology is not known to be clean, then stop the workload.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{error, info, warn};

use crate::context::HarnessContext;
use crate::error::{AssertionPhase, HarnessError, Result};
use crate::stats::{NodeId, Operation, Snapshot};

/// Operation whose commits prove liveness
pub const PROBE: Operation = Operation::Transfer;

/// Scenario progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioState {
    Idle,
    WorkloadRunning,
    Partitioned,
    Healed,
    Stopped,
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScenarioState::Idle => "idle",
            ScenarioState::WorkloadRunning => "workload-running",
            ScenarioState::Partitioned => "partitioned",
            ScenarioState::Healed => "healed",
            ScenarioState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// One polling round
#[derive(Debug, Clone, Serialize)]
pub struct Round {
    pub round: usize,
    pub at: DateTime<Utc>,
    pub delta: Snapshot,
}

/// Observations of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    /// Name of the node that was isolated
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Deltas taken while partitioned
    pub partition_rounds: Vec<Round>,
    /// Deltas taken after healing; the last one was judged
    pub heal_rounds: Vec<Round>,
}

impl ScenarioReport {
    /// Delta of the judged heal round
    pub fn final_round(&self) -> Option<&Round> {
        self.heal_rounds.last()
    }
}

/// Runs the partition/recovery scenario over a [`HarnessContext`]
pub struct PartitionRecoveryScenario {
    context: HarnessContext,
    state: ScenarioState,
}

impl PartitionRecoveryScenario {
    pub fn new(context: HarnessContext) -> Self {
        Self {
            context,
            state: ScenarioState::Idle,
        }
    }

    pub fn state(&self) -> ScenarioState {
        self.state
    }

    pub fn context(&self) -> &HarnessContext {
        &self.context
    }

    fn transition(&mut self, next: ScenarioState) {
        info!(from = %self.state, to = %next, "Scenario transition");
        self.state = next;
    }

    /// Run the scenario to completion, including teardown
    ///
    /// The first failure wins; a teardown failure is only surfaced when the
    /// scenario itself succeeded.
    pub async fn run(&mut self) -> Result<ScenarioReport> {
        let target = self.target_name();
        let mut report = ScenarioReport {
            target: target.clone(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            partition_rounds: Vec::new(),
            heal_rounds: Vec::new(),
        };

        let outcome = self.execute(&target, &mut report).await;
        if let Err(e) = &outcome {
            error!(state = %self.state, error = %e, category = ?e.category(), "Scenario failed");
        }
        let teardown = self.teardown().await;
        report.finished_at = Utc::now();

        match (outcome, teardown) {
            (Ok(()), Ok(())) => Ok(report),
            (Ok(()), Err(e)) => Err(e),
            (Err(e), Err(teardown)) => {
                warn!(error = %teardown, "Teardown also failed");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    fn target_name(&self) -> String {
        let target = self.context.config().scenario.target_node;
        self.context.nodes()[target].name.clone()
    }

    async fn execute(&mut self, target: &str, report: &mut ScenarioReport) -> Result<()> {
        let scenario = self.context.config().scenario.clone();
        let node_count = self.context.nodes().len();

        // Idle -> WorkloadRunning
        self.context.workload().start().await?;
        self.transition(ScenarioState::WorkloadRunning);
        info!(warmup = %humantime::format_duration(scenario.warmup()), "Warming up");
        tokio::time::sleep(scenario.warmup()).await;

        // WorkloadRunning -> Partitioned
        self.context.partitions().partition(target).await?;
        self.transition(ScenarioState::Partitioned);
        // clear tx history
        let _ = self.context.aggregator().snapshot();

        let majority: Vec<NodeId> = (0..node_count).filter(|n| *n != scenario.target_node).collect();
        for round in 0..scenario.partition_rounds {
            let delta = self.poll(round).await;
            info!(
                round,
                node = target,
                commits = delta.commits(PROBE, scenario.target_node),
                "Isolated node (observed only)"
            );
            self.expect_commits(AssertionPhase::Partitioned, round, &delta, &majority)?;
            report.partition_rounds.push(Round {
                round,
                at: Utc::now(),
                delta,
            });
        }

        // Partitioned -> Healed
        self.context.partitions().heal().await?;
        self.transition(ScenarioState::Healed);
        // clear tx history
        let _ = self.context.aggregator().snapshot();

        for round in 0..scenario.heal_rounds {
            let delta = self.poll(round).await;
            report.heal_rounds.push(Round {
                round,
                at: Utc::now(),
                delta,
            });
        }

        let everyone: Vec<NodeId> = (0..node_count).collect();
        if let Some(last) = report.heal_rounds.last() {
            self.expect_commits(AssertionPhase::Healed, last.round, &last.delta, &everyone)?;
        }
        info!(node = target, "Cluster recovered");
        Ok(())
    }

    /// Wait one polling interval and take a delta snapshot
    async fn poll(&self, round: usize) -> Snapshot {
        tokio::time::sleep(self.context.config().scenario.poll_interval()).await;
        let delta = self.context.aggregator().snapshot();
        info!(
            state = %self.state,
            round,
            at = %Utc::now(),
            mean_latency = ?delta.total().mean_latency(),
            delta = %delta.to_json(),
            "Polled status"
        );
        delta
    }

    fn expect_commits(
        &self,
        phase: AssertionPhase,
        round: usize,
        delta: &Snapshot,
        nodes: &[NodeId],
    ) -> Result<()> {
        for &node in nodes {
            if delta.commits(PROBE, node) == 0 {
                return Err(HarnessError::Assertion {
                    phase,
                    round,
                    node: self.context.nodes()[node].name.clone(),
                    snapshot: delta.to_json(),
                });
            }
        }
        Ok(())
    }

    /// Best-effort heal, then stop the workload
    async fn teardown(&mut self) -> Result<()> {
        let partition_state = self.context.partitions().state();
        if partition_state.is_partitioned() {
            info!(state = %partition_state, "Healing before teardown");
            if let Err(e) = self.context.partitions().heal().await {
                warn!(error = %e, "Best-effort heal failed");
            }
        }

        let timeout = self.context.config().scenario.teardown_timeout();
        let stopped = self.context.workload().stop(timeout).await;
        self.transition(ScenarioState::Stopped);
        stopped
    }
}
