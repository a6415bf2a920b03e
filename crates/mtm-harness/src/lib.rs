//! MTM Harness - partition/recovery fault injection for multi-master clusters
//!
//! This crate runs a continuous bank-transfer workload against every node of
//! a multi-master Postgres cluster, cuts one node off with an external
//! partition tool, and checks from per-node transaction outcome counts that
//! the majority keeps committing and that the isolated node comes back after
//! the partition is healed.
//!
//! # Overview
//!
//! - **workload**: one task per (node, operation) issuing transactions
//! - **aggregator**: outcome counters with delta-on-read snapshots
//! - **partition**: control over the external partition tool
//! - **scenario**: the partition → heal → recover state machine
//! - **postgres**: sqlx-backed sessions
//! - **test_utils**: in-memory cluster and scripted partition tool
//!
//! # Example
//!
//! ```rust,no_run
//! use mtm_harness::{HarnessConfig, HarnessContext, PartitionRecoveryScenario};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let context = HarnessContext::postgres(HarnessConfig::local_cluster(3))?;
//!     let mut scenario = PartitionRecoveryScenario::new(context);
//!     let report = scenario.run().await?;
//!     println!("{}", serde_json::to_string_pretty(&report)?);
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod partition;
pub mod postgres;
pub mod scenario;
pub mod stats;
pub mod test_utils;
pub mod workload;

// Re-exports
pub use aggregator::StatusAggregator;
pub use config::{HarnessConfig, PartitionToolConfig, ScenarioConfig, WorkloadConfig};
pub use context::HarnessContext;
pub use endpoint::NodeEndpoint;
pub use error::{AssertionPhase, ErrorCategory, HarnessError, PartitionError, Result, WorkloadError};
pub use partition::{CommandPartitionTool, PartitionController, PartitionState, PartitionTool};
pub use postgres::PgConnector;
pub use scenario::{PartitionRecoveryScenario, Round, ScenarioReport, ScenarioState, PROBE};
pub use stats::{Attempt, NodeId, Operation, OperationKey, OperationStats, Outcome, PhaseCounts, Snapshot};
pub use workload::{Connector, NodeSession, TxFailure, TxOutput, TxRequest, WorkloadDriver};
