//! In-memory cluster doubles for exercising the harness without Postgres
//!
//! [`InMemoryCluster`] behaves like a small multi-master cluster from the
//! outside: a node commits while it can see a majority of the cluster,
//! an isolated node rolls back (or keeps committing locally, see
//! [`InMemoryCluster::with_minority_commits`]), and a healed node only
//! resumes after a configurable recovery delay. [`ScriptedPartitionTool`] records every
//! call, can be told to fail, and can drive an [`InMemoryCluster`].
//!
//! # Example
//!
//! ```rust,ignore
//! let cluster = InMemoryCluster::new(3);
//! let tool = Arc::new(ScriptedPartitionTool::for_cluster(&cluster));
//! let context = HarnessContext::new(config, Arc::new(cluster.connector()), tool)?;
//! ```

use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::endpoint::NodeEndpoint;
use crate::error::{PartitionError, WorkloadError};
use crate::partition::PartitionTool;
use crate::stats::NodeId;
use crate::workload::{Connector, NodeSession, TxFailure, TxOutput, TxRequest};

#[derive(Debug)]
struct ClusterState {
    endpoints: Vec<NodeEndpoint>,
    unreachable: HashSet<NodeId>,
    isolated: HashSet<NodeId>,
    stalled: HashSet<NodeId>,
    /// Nodes still catching up after a heal, with the instant they are ready
    recovering: Vec<(NodeId, Instant)>,
    balances: Vec<i64>,
    recovery_delay: Duration,
    op_latency: Duration,
    fail_prepare: bool,
    minority_commits: bool,
    /// Nodes whose SumTotal blocks its thread while the gate is closed
    hung: HashSet<NodeId>,
}

impl ClusterState {
    fn index_of(&self, name: &str) -> Option<NodeId> {
        self.endpoints.iter().position(|e| e.name == name)
    }

    fn has_quorum(&self, node: NodeId) -> bool {
        if self.isolated.contains(&node) {
            return false;
        }
        let connected = self.endpoints.len() - self.isolated.len();
        connected * 2 > self.endpoints.len()
    }

    fn is_recovering(&mut self, node: NodeId) -> bool {
        let now = Instant::now();
        self.recovering.retain(|(_, ready)| *ready > now);
        self.recovering.iter().any(|(n, _)| *n == node)
    }
}

/// Blocks callers' threads until opened
#[derive(Debug, Default)]
struct Gate {
    closed: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    fn close(&self) {
        *self.closed.lock() = true;
    }

    fn open(&self) {
        *self.closed.lock() = false;
        self.opened.notify_all();
    }

    fn wait(&self) {
        let mut closed = self.closed.lock();
        while *closed {
            self.opened.wait(&mut closed);
        }
    }
}

/// Simulated multi-master cluster
#[derive(Debug, Clone)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
    gate: Arc<Gate>,
}

impl InMemoryCluster {
    /// Cluster of `count` nodes named `node1..nodeN`
    pub fn new(count: usize) -> Self {
        let endpoints = (0..count)
            .map(|i| NodeEndpoint::new(format!("node{}", i + 1), "127.0.0.1", 5432 + i as u16))
            .collect();
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                endpoints,
                unreachable: HashSet::new(),
                isolated: HashSet::new(),
                stalled: HashSet::new(),
                recovering: Vec::new(),
                balances: Vec::new(),
                recovery_delay: Duration::ZERO,
                op_latency: Duration::from_millis(1),
                fail_prepare: false,
                minority_commits: false,
                hung: HashSet::new(),
            })),
            gate: Arc::new(Gate::default()),
        }
    }

    /// Let nodes without a majority keep committing on their own
    pub fn with_minority_commits(self, enabled: bool) -> Self {
        self.state.lock().minority_commits = enabled;
        self
    }

    /// Time a healed node needs before it commits again
    pub fn with_recovery_delay(self, delay: Duration) -> Self {
        self.state.lock().recovery_delay = delay;
        self
    }

    pub fn endpoints(&self) -> Vec<NodeEndpoint> {
        self.state.lock().endpoints.clone()
    }

    /// Connector producing sessions against this cluster
    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            cluster: self.clone(),
        }
    }

    /// Make a node refuse connections and break open sessions
    pub fn set_reachable(&self, node: NodeId, reachable: bool) {
        let mut state = self.state.lock();
        if reachable {
            state.unreachable.remove(&node);
        } else {
            state.unreachable.insert(node);
        }
    }

    /// Keep a node from ever committing, even after a heal
    pub fn set_stalled(&self, node: NodeId, stalled: bool) {
        let mut state = self.state.lock();
        if stalled {
            state.stalled.insert(node);
        } else {
            state.stalled.remove(&node);
        }
    }

    /// Block the worker thread of every SumTotal on `node` until [`release`]
    ///
    /// The session does not yield while blocked, so it cannot observe a stop
    /// signal. Needs a multi-threaded runtime.
    ///
    /// [`release`]: InMemoryCluster::release
    pub fn hang_sum_total(&self, node: NodeId) {
        self.state.lock().hung.insert(node);
        self.gate.close();
    }

    /// Unblock every hung session
    pub fn release(&self) {
        self.state.lock().hung.clear();
        self.gate.open();
    }

    fn is_hung(&self, node: NodeId) -> bool {
        self.state.lock().hung.contains(&node)
    }

    /// Make schema preparation fail
    pub fn fail_prepare(&self, fail: bool) {
        self.state.lock().fail_prepare = fail;
    }

    /// Cut a node off by name
    pub fn isolate(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        match state.index_of(name) {
            Some(node) => {
                state.isolated.insert(node);
                true
            }
            None => false,
        }
    }

    /// Reconnect every isolated node; they commit again after the recovery delay
    pub fn heal(&self) {
        let mut state = self.state.lock();
        let ready = Instant::now() + state.recovery_delay;
        let healed: Vec<NodeId> = state.isolated.drain().collect();
        state.recovering.extend(healed.into_iter().map(|node| (node, ready)));
    }

    /// Shift the bank total away from zero
    pub fn corrupt_total(&self, amount: i64) {
        let mut state = self.state.lock();
        if let Some(first) = state.balances.first_mut() {
            *first += amount;
        }
    }

    pub fn isolated_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self.state.lock().isolated.iter().copied().collect();
        nodes.sort_unstable();
        nodes
    }

    fn execute(&self, node: NodeId, request: &TxRequest) -> Result<TxOutput, TxFailure> {
        let mut state = self.state.lock();
        if state.unreachable.contains(&node) {
            return Err(TxFailure::at_begin(WorkloadError::Failed(
                "connection reset by peer".into(),
            )));
        }
        let cut_off = !state.has_quorum(node) && !state.minority_commits;
        if cut_off || state.stalled.contains(&node) || state.is_recovering(node) {
            return Err(TxFailure::in_body(WorkloadError::Rollback(
                "node is not part of the cluster majority".into(),
            )));
        }

        match *request {
            TxRequest::Transfer { from, to, amount } => {
                let (from, to) = (from as usize, to as usize);
                if from >= state.balances.len() || to >= state.balances.len() {
                    return Err(TxFailure::in_body(WorkloadError::Failed(
                        "relation \"bank_test\" has no such row".into(),
                    )));
                }
                state.balances[from] -= amount as i64;
                state.balances[to] += amount as i64;
                Ok(TxOutput::default())
            }
            TxRequest::SumTotal => Ok(TxOutput {
                total: Some(state.balances.iter().sum()),
            }),
        }
    }
}

/// [`Connector`] over an [`InMemoryCluster`]
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    cluster: InMemoryCluster,
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, endpoint: &NodeEndpoint) -> Result<Box<dyn NodeSession>, WorkloadError> {
        let state = self.cluster.state.lock();
        let node = state.index_of(&endpoint.name).ok_or_else(|| WorkloadError::Connect {
            node: endpoint.name.clone(),
            reason: "unknown node".into(),
        })?;
        if state.unreachable.contains(&node) {
            return Err(WorkloadError::Connect {
                node: endpoint.name.clone(),
                reason: "connection refused".into(),
            });
        }
        Ok(Box::new(InMemorySession {
            cluster: self.cluster.clone(),
            node,
            latency: state.op_latency,
        }))
    }

    async fn prepare(&self, _endpoint: &NodeEndpoint, accounts: u32) -> Result<(), WorkloadError> {
        let mut state = self.cluster.state.lock();
        if state.fail_prepare {
            return Err(WorkloadError::Failed("permission denied for schema public".into()));
        }
        state.balances = vec![0; accounts as usize + 1];
        Ok(())
    }
}

/// Session against one simulated node
pub struct InMemorySession {
    cluster: InMemoryCluster,
    node: NodeId,
    latency: Duration,
}

#[async_trait]
impl NodeSession for InMemorySession {
    async fn execute(&mut self, request: &TxRequest) -> Result<TxOutput, TxFailure> {
        tokio::time::sleep(self.latency).await;
        if *request == TxRequest::SumTotal && self.cluster.is_hung(self.node) {
            self.cluster.gate.wait();
        }
        self.cluster.execute(self.node, request)
    }
}

/// Partition tool double
///
/// Records calls as `"partition <node>"` / `"heal"`.
#[derive(Debug, Default)]
pub struct ScriptedPartitionTool {
    cluster: Option<InMemoryCluster>,
    calls: Mutex<Vec<String>>,
    fail_partition: AtomicBool,
    fail_heal: AtomicBool,
}

impl ScriptedPartitionTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tool that isolates and heals nodes of `cluster`
    pub fn for_cluster(cluster: &InMemoryCluster) -> Self {
        Self {
            cluster: Some(cluster.clone()),
            ..Self::default()
        }
    }

    pub fn fail_partition(&self, fail: bool) {
        self.fail_partition.store(fail, Ordering::SeqCst);
    }

    pub fn fail_heal(&self, fail: bool) {
        self.fail_heal.store(fail, Ordering::SeqCst);
    }

    /// Every call made so far
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of heal calls made so far
    pub fn heal_calls(&self) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == "heal").count()
    }

    fn failure(command: &str) -> PartitionError {
        PartitionError::ToolFailed {
            command: command.to_string(),
            status: "exit status: 1".into(),
            stderr: "scripted failure".into(),
        }
    }
}

#[async_trait]
impl PartitionTool for ScriptedPartitionTool {
    async fn partition(&self, node: &str) -> Result<(), PartitionError> {
        let command = format!("partition {}", node);
        self.calls.lock().push(command.clone());
        if self.fail_partition.load(Ordering::SeqCst) {
            return Err(Self::failure(&command));
        }
        if let Some(cluster) = &self.cluster {
            if !cluster.isolate(node) {
                return Err(PartitionError::ToolFailed {
                    command,
                    status: "exit status: 2".into(),
                    stderr: format!("no such container: {}", node),
                });
            }
        }
        Ok(())
    }

    async fn heal(&self) -> Result<(), PartitionError> {
        self.calls.lock().push("heal".to_string());
        if self.fail_heal.load(Ordering::SeqCst) {
            return Err(Self::failure("heal"));
        }
        if let Some(cluster) = &self.cluster {
            cluster.heal();
        }
        Ok(())
    }
}
