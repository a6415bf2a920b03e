//! Transaction outcome counters and snapshots
//!
//! Every (operation, node) pair owns one [`OperationCells`] block of atomic
//! counters. Workload tasks bump their own block; the aggregator loads the
//! cells into an immutable [`Snapshot`].

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Zero-based index of a node in the configured endpoint list
pub type NodeId = usize;

/// Workload operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    /// Funds transfer between two random accounts (liveness probe)
    Transfer,
    /// Sum over all accounts, expected to stay zero (isolation probe)
    SumTotal,
}

impl Operation {
    /// Name used in snapshot keys and logs
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Transfer => "transfer",
            Operation::SumTotal => "sumtotal",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transaction outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Commit,
    Rollback,
    Error,
}

impl Outcome {
    fn slot(self) -> usize {
        match self {
            Outcome::Commit => 0,
            Outcome::Rollback => 1,
            Outcome::Error => 2,
        }
    }
}

/// Result of one workload transaction, recorded as a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// Outcome of opening the transaction
    pub start: Outcome,
    /// Outcome of the transaction as a whole
    pub finish: Outcome,
    /// The transaction observed state that violates isolation
    pub isolation_error: bool,
    /// Wall time spent on the transaction
    pub latency: Duration,
}

impl Attempt {
    /// A transaction that began and committed
    pub fn committed(latency: Duration) -> Self {
        Self {
            start: Outcome::Commit,
            finish: Outcome::Commit,
            isolation_error: false,
            latency,
        }
    }

    /// A transaction that began but ended with `outcome`
    pub fn aborted(outcome: Outcome, latency: Duration) -> Self {
        Self {
            start: Outcome::Commit,
            finish: outcome,
            isolation_error: false,
            latency,
        }
    }

    /// A transaction that could not even be opened
    pub fn not_started(outcome: Outcome) -> Self {
        Self {
            start: outcome,
            finish: outcome,
            isolation_error: false,
            latency: Duration::ZERO,
        }
    }
}

/// Counts per outcome for one phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseCounts {
    pub commit: u64,
    pub rollback: u64,
    pub error: u64,
}

impl PhaseCounts {
    /// Sum over all outcomes
    pub fn total(&self) -> u64 {
        self.commit + self.rollback + self.error
    }

    fn saturating_sub(&self, other: &Self) -> Self {
        Self {
            commit: self.commit.saturating_sub(other.commit),
            rollback: self.rollback.saturating_sub(other.rollback),
            error: self.error.saturating_sub(other.error),
        }
    }

    fn add(&mut self, other: &Self) {
        self.commit += other.commit;
        self.rollback += other.rollback;
        self.error += other.error;
    }
}

/// Counters for one (operation, node) pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationStats {
    pub start: PhaseCounts,
    pub finish: PhaseCounts,
    pub isolation_errors: u64,
    /// Cumulative latency of transactions that began, in microseconds
    pub latency_us: u64,
}

impl OperationStats {
    /// Mean latency of transactions that began
    ///
    /// Attempts that never got a BEGIN through carry no latency and are
    /// left out of the divisor.
    pub fn mean_latency(&self) -> Option<Duration> {
        let began = self.start.commit;
        (began > 0).then(|| Duration::from_micros(self.latency_us / began))
    }

    /// Element-wise difference, clamped at zero
    pub fn saturating_sub(&self, other: &Self) -> Self {
        Self {
            start: self.start.saturating_sub(&other.start),
            finish: self.finish.saturating_sub(&other.finish),
            isolation_errors: self.isolation_errors.saturating_sub(other.isolation_errors),
            latency_us: self.latency_us.saturating_sub(other.latency_us),
        }
    }

    /// Element-wise sum
    pub fn add(&mut self, other: &Self) {
        self.start.add(&other.start);
        self.finish.add(&other.finish);
        self.isolation_errors += other.isolation_errors;
        self.latency_us += other.latency_us;
    }
}

/// Snapshot key: `transfer_0`, `sumtotal_2`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationKey {
    pub operation: Operation,
    pub node: NodeId,
}

impl OperationKey {
    pub fn new(operation: Operation, node: NodeId) -> Self {
        Self { operation, node }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.operation, self.node)
    }
}

impl Serialize for OperationKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Immutable copy of outcome counters at one point in time
///
/// Produced either as cumulative totals or as a delta against the previous
/// read, see [`StatusAggregator`](crate::aggregator::StatusAggregator).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    entries: BTreeMap<OperationKey, OperationStats>,
}

impl Snapshot {
    /// Build a snapshot from (key, stats) pairs
    pub fn from_entries(entries: impl IntoIterator<Item = (OperationKey, OperationStats)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Stats for one (operation, node) pair; zero when not registered
    pub fn get(&self, operation: Operation, node: NodeId) -> OperationStats {
        self.entries
            .get(&OperationKey::new(operation, node))
            .copied()
            .unwrap_or_default()
    }

    /// Finished commits for one (operation, node) pair
    pub fn commits(&self, operation: Operation, node: NodeId) -> u64 {
        self.get(operation, node).finish.commit
    }

    /// Iterate over all entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&OperationKey, &OperationStats)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum over every entry
    pub fn total(&self) -> OperationStats {
        let mut total = OperationStats::default();
        for stats in self.entries.values() {
            total.add(stats);
        }
        total
    }

    /// Element-wise `self - baseline`; keys missing from the baseline count as zero
    pub fn delta_since(&self, baseline: &Snapshot) -> Snapshot {
        let entries = self
            .entries
            .iter()
            .map(|(key, stats)| {
                let base = baseline.entries.get(key).copied().unwrap_or_default();
                (*key, stats.saturating_sub(&base))
            })
            .collect();
        Snapshot { entries }
    }

    /// Accumulate another snapshot into this one
    pub fn accumulate(&mut self, other: &Snapshot) {
        for (key, stats) in &other.entries {
            self.entries.entry(*key).or_default().add(stats);
        }
    }

    /// Compact JSON rendering for logs and error reports
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("<unserializable: {}>", e))
    }
}

/// Atomic counter block for one (operation, node) pair
#[derive(Debug, Default)]
pub struct OperationCells {
    start: [AtomicU64; 3],
    finish: [AtomicU64; 3],
    isolation_errors: AtomicU64,
    latency_us: AtomicU64,
}

impl OperationCells {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished attempt
    pub fn record(&self, attempt: &Attempt) {
        self.start[attempt.start.slot()].fetch_add(1, Ordering::Relaxed);
        if attempt.isolation_error {
            self.isolation_errors.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(attempt.latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_us.fetch_add(micros, Ordering::Relaxed);
        self.finish[attempt.finish.slot()].fetch_add(1, Ordering::Relaxed);
    }

    /// Load every cell once
    pub fn load(&self) -> OperationStats {
        let phase = |cells: &[AtomicU64; 3]| PhaseCounts {
            commit: cells[0].load(Ordering::Relaxed),
            rollback: cells[1].load(Ordering::Relaxed),
            error: cells[2].load(Ordering::Relaxed),
        };
        OperationStats {
            start: phase(&self.start),
            finish: phase(&self.finish),
            isolation_errors: self.isolation_errors.load(Ordering::Relaxed),
            latency_us: self.latency_us.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        assert_eq!(OperationKey::new(Operation::Transfer, 0).to_string(), "transfer_0");
        assert_eq!(OperationKey::new(Operation::SumTotal, 2).to_string(), "sumtotal_2");
    }

    #[test]
    fn test_cells_record() {
        let cells = OperationCells::new();
        cells.record(&Attempt::committed(Duration::from_micros(100)));
        cells.record(&Attempt::aborted(Outcome::Rollback, Duration::from_micros(50)));
        cells.record(&Attempt::not_started(Outcome::Error));

        let stats = cells.load();
        assert_eq!(stats.start.commit, 2);
        assert_eq!(stats.start.error, 1);
        assert_eq!(stats.finish.commit, 1);
        assert_eq!(stats.finish.rollback, 1);
        assert_eq!(stats.finish.error, 1);
        assert_eq!(stats.latency_us, 150);
        assert_eq!(stats.mean_latency(), Some(Duration::from_micros(75)));
    }

    #[test]
    fn test_mean_latency_ignores_unstarted_attempts() {
        let cells = OperationCells::new();
        cells.record(&Attempt::committed(Duration::from_micros(200)));
        for _ in 0..3 {
            cells.record(&Attempt::not_started(Outcome::Error));
        }
        assert_eq!(cells.load().mean_latency(), Some(Duration::from_micros(200)));

        let idle = OperationCells::new();
        idle.record(&Attempt::not_started(Outcome::Error));
        assert_eq!(idle.load().mean_latency(), None);
    }

    #[test]
    fn test_delta_never_negative() {
        let mut high = OperationStats::default();
        high.finish.commit = 3;
        let mut low = OperationStats::default();
        low.finish.commit = 5;

        let key = OperationKey::new(Operation::Transfer, 0);
        let current = Snapshot::from_entries([(key, high)]);
        let baseline = Snapshot::from_entries([(key, low)]);
        assert_eq!(current.delta_since(&baseline).commits(Operation::Transfer, 0), 0);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut stats = OperationStats::default();
        stats.finish.commit = 7;
        let snapshot = Snapshot::from_entries([(OperationKey::new(Operation::Transfer, 1), stats)]);

        let value: serde_json::Value = serde_json::from_str(&snapshot.to_json()).unwrap();
        assert_eq!(value["transfer_1"]["finish"]["commit"], 7);
        assert_eq!(value["transfer_1"]["start"]["rollback"], 0);
    }

    #[test]
    fn test_missing_key_reads_zero() {
        let snapshot = Snapshot::default();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.commits(Operation::Transfer, 5), 0);
        assert_eq!(snapshot.total(), OperationStats::default());
    }
}
