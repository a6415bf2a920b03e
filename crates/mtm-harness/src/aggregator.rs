//! Delta-on-read status aggregation
//!
//! The aggregator owns the counter store. Workload tasks get an
//! `Arc<OperationCells>` at registration time and never touch the registry
//! again, so the read path only contends with registration.
//!
//! # Read semantics
//!
//! [`StatusAggregator::snapshot`] is deliberately not idempotent: it returns
//! the counts accumulated since the previous call and makes the current state
//! the new baseline ("clear history"). Callers reason about "commits since
//! the last check", never about lifetime totals. Use
//! [`StatusAggregator::totals`] for a read that leaves the baseline alone.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::stats::{NodeId, Operation, OperationCells, OperationKey, Snapshot};

/// Owner of the outcome counters
#[derive(Debug, Default)]
pub struct StatusAggregator {
    cells: RwLock<BTreeMap<OperationKey, Arc<OperationCells>>>,
    baseline: Mutex<Snapshot>,
}

impl StatusAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter block for an (operation, node) pair, created on first use
    pub fn register(&self, operation: Operation, node: NodeId) -> Arc<OperationCells> {
        let key = OperationKey::new(operation, node);
        if let Some(cells) = self.cells.read().get(&key) {
            return cells.clone();
        }
        self.cells
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(OperationCells::new()))
            .clone()
    }

    /// Number of registered (operation, node) pairs
    pub fn registered(&self) -> usize {
        self.cells.read().len()
    }

    /// Cumulative counters; does not move the baseline
    pub fn totals(&self) -> Snapshot {
        let cells = self.cells.read();
        Snapshot::from_entries(cells.iter().map(|(key, cells)| (*key, cells.load())))
    }

    /// Counts since the previous `snapshot()` call, rebasing the baseline
    ///
    /// The first call returns the cumulative state. Every cell is loaded
    /// exactly once and that value becomes the new baseline, so an increment
    /// racing with the read lands in exactly one of two consecutive deltas.
    pub fn snapshot(&self) -> Snapshot {
        let mut baseline = self.baseline.lock();
        let current = self.totals();
        let delta = current.delta_since(&baseline);
        *baseline = current;
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Attempt, Outcome};
    use std::time::Duration;

    fn commit() -> Attempt {
        Attempt::committed(Duration::from_micros(10))
    }

    #[test]
    fn test_empty_aggregator() {
        let aggregator = StatusAggregator::new();
        assert!(aggregator.snapshot().is_empty());
        assert!(aggregator.totals().is_empty());
    }

    #[test]
    fn test_first_snapshot_is_cumulative() {
        let aggregator = StatusAggregator::new();
        let cells = aggregator.register(Operation::Transfer, 0);
        cells.record(&commit());
        cells.record(&commit());

        assert_eq!(aggregator.snapshot().commits(Operation::Transfer, 0), 2);
    }

    #[test]
    fn test_snapshot_clears_history() {
        let aggregator = StatusAggregator::new();
        let cells = aggregator.register(Operation::Transfer, 0);
        cells.record(&commit());
        let _ = aggregator.snapshot();

        let delta = aggregator.snapshot();
        assert_eq!(delta.commits(Operation::Transfer, 0), 0);
        assert_eq!(delta.len(), 1);

        cells.record(&commit());
        cells.record(&Attempt::aborted(Outcome::Rollback, Duration::ZERO));
        let delta = aggregator.snapshot();
        assert_eq!(delta.commits(Operation::Transfer, 0), 1);
        assert_eq!(delta.get(Operation::Transfer, 0).finish.rollback, 1);

        // totals are unaffected by delta reads
        assert_eq!(aggregator.totals().commits(Operation::Transfer, 0), 2);
    }

    #[test]
    fn test_register_is_idempotent() {
        let aggregator = StatusAggregator::new();
        let a = aggregator.register(Operation::Transfer, 1);
        let b = aggregator.register(Operation::Transfer, 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(aggregator.registered(), 1);
    }

    #[test]
    fn test_concurrent_writers_no_lost_updates() {
        let aggregator = Arc::new(StatusAggregator::new());
        let writers: Vec<_> = (0..4)
            .map(|node| {
                let cells = aggregator.register(Operation::Transfer, node);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        cells.record(&commit());
                    }
                })
            })
            .collect();

        let mut sum = Snapshot::default();
        while writers.iter().any(|w| !w.is_finished()) {
            sum.accumulate(&aggregator.snapshot());
        }
        for writer in writers {
            writer.join().unwrap();
        }
        sum.accumulate(&aggregator.snapshot());

        assert_eq!(sum, aggregator.totals());
        for node in 0..4 {
            assert_eq!(sum.commits(Operation::Transfer, node), 10_000);
        }
    }
}
