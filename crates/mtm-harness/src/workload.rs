//! Background transactional workload
//!
//! The [`WorkloadDriver`] runs one tokio task per (node, operation) pair.
//! Each task loops over a single kind of transaction against its node and
//! records every finished attempt in the counters it got from the
//! [`StatusAggregator`]. A failed transaction is an outcome, not a reason to
//! stop: the task reconnects if needed and carries on.
//!
//! Database access goes through the [`Connector`] and [`NodeSession`] traits
//! so the driver can run against Postgres ([`crate::postgres`]) or against
//! the in-memory cluster in [`crate::test_utils`].

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::aggregator::StatusAggregator;
use crate::config::WorkloadConfig;
use crate::endpoint::NodeEndpoint;
use crate::error::{HarnessError, Result, WorkloadError};
use crate::stats::{Attempt, NodeId, Operation, OperationCells, OperationKey, Outcome};

/// One transaction to run against a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxRequest {
    /// Move `amount` from account `from` to account `to`
    Transfer { from: u32, to: u32, amount: i32 },
    /// Read the sum over all accounts
    SumTotal,
}

/// Data returned by a committed transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOutput {
    /// Sum over all accounts, for [`TxRequest::SumTotal`]
    pub total: Option<i64>,
}

/// A failed transaction
#[derive(Debug)]
pub struct TxFailure {
    /// Whether BEGIN had succeeded before the failure
    pub began: bool,
    pub error: WorkloadError,
}

impl TxFailure {
    /// The transaction could not be opened
    pub fn at_begin(error: impl Into<WorkloadError>) -> Self {
        Self {
            began: false,
            error: error.into(),
        }
    }

    /// The transaction failed after BEGIN
    pub fn in_body(error: impl Into<WorkloadError>) -> Self {
        Self {
            began: true,
            error: error.into(),
        }
    }
}

/// Open connection to one node
#[async_trait]
pub trait NodeSession: Send {
    /// Run one transaction to completion
    async fn execute(&mut self, request: &TxRequest) -> std::result::Result<TxOutput, TxFailure>;
}

/// Factory for node sessions
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a session to `endpoint`
    async fn connect(
        &self,
        endpoint: &NodeEndpoint,
    ) -> std::result::Result<Box<dyn NodeSession>, WorkloadError>;

    /// Create the bank table with `accounts` zero-balance rows
    async fn prepare(
        &self,
        endpoint: &NodeEndpoint,
        accounts: u32,
    ) -> std::result::Result<(), WorkloadError>;
}

/// State owned by one workload task
struct WorkerContext {
    key: OperationKey,
    endpoint: NodeEndpoint,
    connector: Arc<dyn Connector>,
    cells: Arc<OperationCells>,
    accounts: u32,
    reconnect_delay: Duration,
}

impl WorkerContext {
    fn next_request(&self) -> TxRequest {
        match self.key.operation {
            Operation::Transfer => {
                let mut rng = rand::thread_rng();
                let upper = self.accounts.max(2);
                TxRequest::Transfer {
                    from: rng.gen_range(1..upper),
                    to: rng.gen_range(1..upper),
                    amount: 1,
                }
            }
            Operation::SumTotal => TxRequest::SumTotal,
        }
    }

    /// Run one transaction, (re)connecting first when there is no session
    async fn step(&self, session: &mut Option<Box<dyn NodeSession>>) -> Attempt {
        let mut current = match session.take() {
            Some(current) => current,
            None => match self.connector.connect(&self.endpoint).await {
                Ok(current) => {
                    info!(node = %self.endpoint.name, op = %self.key.operation, "Reconnected");
                    current
                }
                Err(e) => {
                    debug!(node = %self.endpoint.name, error = %e, "Reconnect failed");
                    return Attempt::not_started(e.outcome());
                }
            },
        };

        let request = self.next_request();
        let started = Instant::now();
        let result = current.execute(&request).await;
        let latency = started.elapsed();

        match result {
            Ok(output) => {
                *session = Some(current);
                let mut attempt = Attempt::committed(latency);
                attempt.isolation_error = matches!(output.total, Some(total) if total != 0);
                if attempt.isolation_error {
                    warn!(node = %self.endpoint.name, total = ?output.total, "Bank total is not zero");
                }
                attempt
            }
            Err(failure) => {
                debug!(key = %self.key, error = %failure.error, "Transaction failed");
                if !failure.error.needs_reconnect() {
                    *session = Some(current);
                }
                if failure.began {
                    Attempt::aborted(failure.error.outcome(), latency)
                } else {
                    Attempt::not_started(failure.error.outcome())
                }
            }
        }
    }
}

/// Workload task body
///
/// The stop signal is checked between transactions and raced against the
/// one in flight; an interrupted transaction is never recorded.
async fn run_worker(
    ctx: WorkerContext,
    session: Box<dyn NodeSession>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut session = Some(session);
    let mut completed: u64 = 0;

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let attempt = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            attempt = ctx.step(&mut session) => attempt,
        };
        ctx.cells.record(&attempt);
        completed += 1;

        if attempt.finish == Outcome::Error {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(ctx.reconnect_delay) => {}
            }
        }
    }

    debug!(key = %ctx.key, completed, "Workload task stopped");
}

struct Running {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<(OperationKey, JoinHandle<()>)>,
}

/// Runs the transactional workload against every node
pub struct WorkloadDriver {
    endpoints: Vec<NodeEndpoint>,
    connector: Arc<dyn Connector>,
    aggregator: Arc<StatusAggregator>,
    config: WorkloadConfig,
    running: Option<Running>,
}

impl WorkloadDriver {
    /// Create a driver; nothing runs until [`start`](Self::start)
    pub fn new(
        endpoints: Vec<NodeEndpoint>,
        connector: Arc<dyn Connector>,
        aggregator: Arc<StatusAggregator>,
        config: WorkloadConfig,
    ) -> Self {
        Self {
            endpoints,
            connector,
            aggregator,
            config,
            running: None,
        }
    }

    /// Operations run against every node
    pub fn operations(&self) -> Vec<Operation> {
        if self.config.check_totals {
            vec![Operation::Transfer, Operation::SumTotal]
        } else {
            vec![Operation::Transfer]
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Prepare the schema, connect every task and spawn the workload
    ///
    /// Any failure here is a setup failure; nothing is spawned unless every
    /// initial connection succeeded.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(HarnessError::Setup("Workload already running".into()));
        }
        let first = self
            .endpoints
            .first()
            .ok_or_else(|| HarnessError::Setup("No nodes configured".into()))?;

        if self.config.prepare_schema {
            self.connector
                .prepare(first, self.config.accounts)
                .await
                .map_err(|e| HarnessError::Setup(format!("Schema preparation failed: {}", e)))?;
            info!(node = %first.name, accounts = self.config.accounts, "Prepared bank table");
        }

        let mut workers = Vec::new();
        for (node, endpoint) in self.endpoints.iter().enumerate() {
            for operation in self.operations() {
                let session = self
                    .connector
                    .connect(endpoint)
                    .await
                    .map_err(|e| HarnessError::Setup(e.to_string()))?;
                workers.push((self.worker_context(node, endpoint, operation), session));
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let tasks = workers
            .into_iter()
            .map(|(ctx, session)| {
                let key = ctx.key;
                (key, tokio::spawn(run_worker(ctx, session, stop_rx.clone())))
            })
            .collect::<Vec<_>>();

        info!(
            nodes = self.endpoints.len(),
            tasks = tasks.len(),
            "Workload started"
        );
        self.running = Some(Running { stop_tx, tasks });
        Ok(())
    }

    fn worker_context(&self, node: NodeId, endpoint: &NodeEndpoint, operation: Operation) -> WorkerContext {
        WorkerContext {
            key: OperationKey::new(operation, node),
            endpoint: endpoint.clone(),
            connector: self.connector.clone(),
            cells: self.aggregator.register(operation, node),
            accounts: self.config.accounts,
            reconnect_delay: self.config.reconnect_delay(),
        }
    }

    /// Signal every task and wait for all of them to exit
    ///
    /// Tasks still running after `timeout` are aborted and reported as a
    /// teardown failure. Stopping an idle driver does nothing.
    pub async fn stop(&mut self, timeout: Duration) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let _ = running.stop_tx.send(true);

        let aborts: Vec<AbortHandle> = running.tasks.iter().map(|(_, h)| h.abort_handle()).collect();
        let (keys, handles): (Vec<_>, Vec<_>) = running.tasks.into_iter().unzip();

        let results = match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(results) => results,
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                return Err(HarnessError::Teardown(format!(
                    "Workload tasks did not stop within {}",
                    humantime::format_duration(timeout)
                )));
            }
        };

        let failed: Vec<String> = keys
            .iter()
            .zip(results)
            .filter_map(|(key, result)| result.err().map(|e| format!("{}: {}", key, e)))
            .collect();
        if !failed.is_empty() {
            return Err(HarnessError::Teardown(format!(
                "Workload tasks failed: {}",
                failed.join(", ")
            )));
        }

        info!("Workload stopped");
        Ok(())
    }
}

impl Drop for WorkloadDriver {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            warn!("Workload dropped while running; signalling tasks to stop");
            let _ = running.stop_tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::test_utils::InMemoryCluster;

    fn driver(cluster: &InMemoryCluster, check_totals: bool) -> (WorkloadDriver, Arc<StatusAggregator>) {
        let aggregator = Arc::new(StatusAggregator::new());
        let config = WorkloadConfig {
            accounts: 100,
            check_totals,
            reconnect_delay_ms: 5,
            ..WorkloadConfig::default()
        };
        let driver = WorkloadDriver::new(
            cluster.endpoints(),
            Arc::new(cluster.connector()),
            aggregator.clone(),
            config,
        );
        (driver, aggregator)
    }

    #[tokio::test]
    async fn test_start_registers_every_pair() {
        let cluster = InMemoryCluster::new(3);
        let (mut driver, aggregator) = driver(&cluster, true);

        driver.start().await.unwrap();
        assert!(driver.is_running());
        assert_eq!(aggregator.registered(), 6);

        driver.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!driver.is_running());
    }

    #[tokio::test]
    async fn test_double_start_is_setup_error() {
        let cluster = InMemoryCluster::new(2);
        let (mut driver, _) = driver(&cluster, false);

        driver.start().await.unwrap();
        let err = driver.start().await.unwrap_err();
        assert!(matches!(err, HarnessError::Setup(_)));
        driver.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_node_at_start_is_setup_error() {
        let cluster = InMemoryCluster::new(3);
        cluster.set_reachable(1, false);
        let (mut driver, _) = driver(&cluster, false);

        let err = driver.start().await.unwrap_err();
        assert!(matches!(err, HarnessError::Setup(_)));
        assert!(!driver.is_running());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let cluster = InMemoryCluster::new(2);
        let (mut driver, _) = driver(&cluster, false);
        driver.stop(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_node_keeps_others_running() {
        let cluster = InMemoryCluster::new(3);
        let (mut driver, aggregator) = driver(&cluster, false);

        driver.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cluster.set_reachable(2, false);
        let _ = aggregator.snapshot();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let delta = aggregator.snapshot();
        driver.stop(Duration::from_secs(5)).await.unwrap();

        assert!(delta.commits(Operation::Transfer, 0) > 0);
        assert!(delta.commits(Operation::Transfer, 1) > 0);
        assert!(delta.get(Operation::Transfer, 2).finish.error > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stuck_task_is_teardown_failure() {
        let cluster = InMemoryCluster::new(2);
        cluster.hang_sum_total(0);
        let (mut driver, aggregator) = driver(&cluster, true);

        driver.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let result = driver.stop(Duration::from_millis(50)).await;
        cluster.release();

        let err = result.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Teardown);
        assert!(!driver.is_running());
        assert!(aggregator.totals().commits(Operation::Transfer, 0) > 0);
    }

    #[tokio::test]
    async fn test_sum_total_probe_is_clean() {
        let cluster = InMemoryCluster::new(2);
        let (mut driver, aggregator) = driver(&cluster, true);

        driver.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        driver.stop(Duration::from_secs(5)).await.unwrap();

        let totals = aggregator.totals();
        assert!(totals.commits(Operation::SumTotal, 0) > 0);
        assert_eq!(totals.total().isolation_errors, 0);
    }
}
