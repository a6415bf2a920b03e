//! Network partition control
//!
//! The harness does not cut links itself. It asks an external tool
//! (`blockade` by default) to isolate a named node and later to restore
//! full connectivity. The [`PartitionController`] wraps that tool and keeps
//! track of what it believes the topology to be.
//!
//! # Example
//!
//! ```rust,ignore
//! let controller = PartitionController::new(Arc::new(CommandPartitionTool::new(config)));
//! controller.partition("node3").await?;
//! assert!(controller.state().is_partitioned());
//! controller.heal().await?;
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::PartitionToolConfig;
use crate::error::PartitionError;

/// What the controller knows about the cluster topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionState {
    /// Full connectivity
    Connected,
    /// The named node is cut off from the rest
    Isolated(String),
    /// A tool invocation failed half way; topology is unknown
    Unknown,
}

impl PartitionState {
    /// Whether a heal is needed to get back to a known-clean topology
    pub fn is_partitioned(&self) -> bool {
        !matches!(self, PartitionState::Connected)
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionState::Connected => write!(f, "connected"),
            PartitionState::Isolated(node) => write!(f, "isolated({})", node),
            PartitionState::Unknown => write!(f, "unknown"),
        }
    }
}

/// External partitioning facility
#[async_trait]
pub trait PartitionTool: Send + Sync {
    /// Cut `node` off from the rest of the cluster
    async fn partition(&self, node: &str) -> Result<(), PartitionError>;

    /// Remove every partition
    async fn heal(&self) -> Result<(), PartitionError>;
}

/// Runs the partition tool as a child process
#[derive(Debug, Clone)]
pub struct CommandPartitionTool {
    config: PartitionToolConfig,
}

impl CommandPartitionTool {
    pub fn new(config: PartitionToolConfig) -> Self {
        Self { config }
    }

    /// Arguments for partitioning `node`
    pub fn partition_args(&self, node: &str) -> Vec<String> {
        self.config
            .partition_args
            .iter()
            .map(|arg| arg.replace("{node}", node))
            .collect()
    }

    async fn run(&self, args: &[String]) -> Result<(), PartitionError> {
        let command = format!("{} {}", self.config.program, args.join(" "));
        info!(command = %command, "Running partition tool");

        let output = Command::new(&self.config.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PartitionError::ToolUnavailable {
                program: self.config.program.clone(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(PartitionError::ToolFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl PartitionTool for CommandPartitionTool {
    async fn partition(&self, node: &str) -> Result<(), PartitionError> {
        self.run(&self.partition_args(node)).await
    }

    async fn heal(&self) -> Result<(), PartitionError> {
        self.run(&self.config.heal_args).await
    }
}

/// Control surface over a [`PartitionTool`]
///
/// Calls are blocking from the scenario's point of view and never retried.
/// At most one partition is outstanding at a time.
pub struct PartitionController {
    tool: Arc<dyn PartitionTool>,
    state: Mutex<PartitionState>,
}

impl PartitionController {
    pub fn new(tool: Arc<dyn PartitionTool>) -> Self {
        Self {
            tool,
            state: Mutex::new(PartitionState::Connected),
        }
    }

    /// Current believed topology
    pub fn state(&self) -> PartitionState {
        self.state.lock().clone()
    }

    /// Isolate `node`
    ///
    /// Refused while another partition is outstanding. A tool failure leaves
    /// the state [`PartitionState::Unknown`].
    pub async fn partition(&self, node: &str) -> Result<(), PartitionError> {
        {
            let state = self.state.lock();
            if let PartitionState::Isolated(current) = &*state {
                return Err(PartitionError::AlreadyPartitioned {
                    current: current.clone(),
                    requested: node.to_string(),
                });
            }
        }

        match self.tool.partition(node).await {
            Ok(()) => {
                *self.state.lock() = PartitionState::Isolated(node.to_string());
                info!(node, "Node partitioned");
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = PartitionState::Unknown;
                warn!(node, error = %e, "Partition failed");
                Err(e)
            }
        }
    }

    /// Restore full connectivity
    pub async fn heal(&self) -> Result<(), PartitionError> {
        match self.tool.heal().await {
            Ok(()) => {
                let previous = std::mem::replace(&mut *self.state.lock(), PartitionState::Connected);
                info!(previous = %previous, "Partitions healed");
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = PartitionState::Unknown;
                warn!(error = %e, "Heal failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedPartitionTool;

    fn shell_tool(program: &str) -> CommandPartitionTool {
        CommandPartitionTool::new(PartitionToolConfig {
            program: program.to_string(),
            partition_args: vec!["partition".into(), "{node}".into()],
            heal_args: vec!["join".into()],
        })
    }

    #[test]
    fn test_partition_args_substitute_node() {
        let tool = CommandPartitionTool::new(PartitionToolConfig::default());
        assert_eq!(tool.partition_args("node3"), vec!["partition", "node3"]);
    }

    #[tokio::test]
    async fn test_successful_command() {
        // `true` ignores its arguments and exits 0
        let tool = shell_tool("true");
        tool.partition("node3").await.unwrap();
        tool.heal().await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_tool_failure() {
        let tool = shell_tool("false");
        let err = tool.partition("node3").await.unwrap_err();
        match err {
            PartitionError::ToolFailed { command, .. } => assert_eq!(command, "false partition node3"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let tool = shell_tool("/nonexistent/partition-tool");
        let err = tool.heal().await.unwrap_err();
        assert!(matches!(err, PartitionError::ToolUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_controller_tracks_state() {
        let tool = Arc::new(ScriptedPartitionTool::new());
        let controller = PartitionController::new(tool.clone());
        assert_eq!(controller.state(), PartitionState::Connected);

        controller.partition("node3").await.unwrap();
        assert_eq!(controller.state(), PartitionState::Isolated("node3".into()));

        controller.heal().await.unwrap();
        assert_eq!(controller.state(), PartitionState::Connected);
        assert_eq!(tool.calls(), vec!["partition node3", "heal"]);
    }

    #[tokio::test]
    async fn test_controller_refuses_double_partition() {
        let tool = Arc::new(ScriptedPartitionTool::new());
        let controller = PartitionController::new(tool.clone());

        controller.partition("node3").await.unwrap();
        let err = controller.partition("node2").await.unwrap_err();
        assert!(matches!(err, PartitionError::AlreadyPartitioned { .. }));
        assert_eq!(tool.calls(), vec!["partition node3"]);
    }

    #[tokio::test]
    async fn test_failed_partition_leaves_unknown_state() {
        let tool = Arc::new(ScriptedPartitionTool::new());
        tool.fail_partition(true);
        let controller = PartitionController::new(tool);

        assert!(controller.partition("node3").await.is_err());
        assert_eq!(controller.state(), PartitionState::Unknown);
        assert!(controller.state().is_partitioned());
    }
}
