//! Per-database statistics.
//!
//! Counters are written by the engine and only ever read by callers
//! (diagnostics, the CLI). Nothing in the engine branches on them.
//!
//! ```rust,ignore
//! let stats = db.stats();
//! println!("creates: {}", stats.op(OpType::Create).ok);
//! println!("commits: {}", stats.transactions_committed);
//! ```

use crate::error::ErrorCategory;
use crate::wal::OpType;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Operation kinds counted by [`DatabaseStats`].
const COUNTED_OPS: [OpType; 8] = [
    OpType::Create,
    OpType::Read,
    OpType::Update,
    OpType::Delete,
    OpType::Patch,
    OpType::CreateCollection,
    OpType::DeleteCollection,
    OpType::Checkpoint,
];

fn op_slot(op: OpType) -> Option<usize> {
    COUNTED_OPS.iter().position(|&counted| counted == op)
}

#[derive(Debug, Default)]
struct OpCounter {
    ok: AtomicU64,
    failed: AtomicU64,
}

/// Atomic counters for one logical database.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    ops: [OpCounter; COUNTED_OPS.len()],
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
    conflicts: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    errors: [AtomicU64; ErrorCategory::ALL.len()],
    checkpoints: AtomicU64,
    compactions: AtomicU64,
    versions_reclaimed: AtomicU64,
    replayed_records: AtomicU64,
    latency_micros: AtomicU64,
    latency_samples: AtomicU64,
}

impl DatabaseStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one operation and its outcome.
    pub(crate) fn record_op(&self, op: OpType, succeeded: bool) {
        if let Some(slot) = op_slot(op) {
            let counter = &self.ops[slot];
            if succeeded {
                counter.ok.fetch_add(1, Ordering::Relaxed);
            } else {
                counter.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Counts an error under its category; conflicts are also counted apart.
    pub(crate) fn record_error(&self, category: ErrorCategory) {
        self.errors[category.index()].fetch_add(1, Ordering::Relaxed);
        if category == ErrorCategory::Conflict {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction(&self, reclaimed: u64) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.versions_reclaimed
            .fetch_add(reclaimed, Ordering::Relaxed);
    }

    pub(crate) fn record_replayed(&self, records: u64) {
        self.replayed_records.fetch_add(records, Ordering::Relaxed);
    }

    pub(crate) fn record_latency(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of committed transactions.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Number of write-write conflicts reported.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Returns a plain copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            ops: COUNTED_OPS
                .iter()
                .zip(&self.ops)
                .map(|(&op, counter)| OpCount {
                    op,
                    ok: load(&counter.ok),
                    failed: load(&counter.failed),
                })
                .collect(),
            transactions_started: load(&self.transactions_started),
            transactions_committed: load(&self.transactions_committed),
            transactions_aborted: load(&self.transactions_aborted),
            conflicts: load(&self.conflicts),
            bytes_written: load(&self.bytes_written),
            bytes_read: load(&self.bytes_read),
            errors: ErrorCategory::ALL
                .iter()
                .map(|&category| (category, load(&self.errors[category.index()])))
                .collect(),
            checkpoints: load(&self.checkpoints),
            compactions: load(&self.compactions),
            versions_reclaimed: load(&self.versions_reclaimed),
            replayed_records: load(&self.replayed_records),
            latency_micros: load(&self.latency_micros),
            latency_samples: load(&self.latency_samples),
        }
    }
}

/// Successes and failures of one operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OpCount {
    /// Operation kind.
    pub op: OpType,
    /// Successful executions.
    pub ok: u64,
    /// Failed executions.
    pub failed: u64,
}

/// A point-in-time copy of [`DatabaseStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Per-operation counts.
    pub ops: Vec<OpCount>,
    /// Transactions begun.
    pub transactions_started: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions aborted (explicitly, by error or by deadline).
    pub transactions_aborted: u64,
    /// Write-write conflicts.
    pub conflicts: u64,
    /// Payload bytes written.
    pub bytes_written: u64,
    /// Payload bytes read.
    pub bytes_read: u64,
    /// Errors by category.
    pub errors: Vec<(ErrorCategory, u64)>,
    /// Checkpoints written.
    pub checkpoints: u64,
    /// Compaction passes.
    pub compactions: u64,
    /// Versions dropped by compaction.
    pub versions_reclaimed: u64,
    /// WAL records applied during recovery.
    pub replayed_records: u64,
    /// Sum of request latencies in microseconds.
    pub latency_micros: u64,
    /// Number of latency samples.
    pub latency_samples: u64,
}

impl StatsSnapshot {
    /// Counts for `op`, zero if it is not tracked.
    #[must_use]
    pub fn op(&self, op: OpType) -> OpCount {
        self.ops
            .iter()
            .copied()
            .find(|count| count.op == op)
            .unwrap_or(OpCount { op, ok: 0, failed: 0 })
    }

    /// Errors counted under `category`.
    #[must_use]
    pub fn errors_in(&self, category: ErrorCategory) -> u64 {
        self.errors
            .iter()
            .find(|(c, _)| *c == category)
            .map_or(0, |(_, n)| *n)
    }

    /// Mean request latency.
    #[must_use]
    pub fn mean_latency(&self) -> Option<Duration> {
        (self.latency_samples > 0)
            .then(|| Duration::from_micros(self.latency_micros / self.latency_samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let snap = DatabaseStats::new().snapshot();
        assert_eq!(snap.transactions_committed, 0);
        assert_eq!(snap.op(OpType::Create).ok, 0);
        assert_eq!(snap.mean_latency(), None);
    }

    #[test]
    fn ops_by_status() {
        let stats = DatabaseStats::new();
        stats.record_op(OpType::Create, true);
        stats.record_op(OpType::Create, true);
        stats.record_op(OpType::Update, false);
        stats.record_op(OpType::Commit, true);

        let snap = stats.snapshot();
        assert_eq!(snap.op(OpType::Create).ok, 2);
        assert_eq!(snap.op(OpType::Update).failed, 1);
        assert_eq!(snap.op(OpType::Commit), OpCount { op: OpType::Commit, ok: 0, failed: 0 });
    }

    #[test]
    fn errors_by_category() {
        let stats = DatabaseStats::new();
        stats.record_error(ErrorCategory::Conflict);
        stats.record_error(ErrorCategory::NotFound);
        stats.record_error(ErrorCategory::NotFound);

        let snap = stats.snapshot();
        assert_eq!(snap.errors_in(ErrorCategory::NotFound), 2);
        assert_eq!(snap.errors_in(ErrorCategory::Conflict), 1);
        assert_eq!(snap.conflicts, 1);
    }

    #[test]
    fn latency_mean() {
        let stats = DatabaseStats::new();
        stats.record_latency(Duration::from_micros(100));
        stats.record_latency(Duration::from_micros(300));
        assert_eq!(
            stats.snapshot().mean_latency(),
            Some(Duration::from_micros(200))
        );
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(DatabaseStats::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_op(OpType::Read, true);
                        s.record_bytes_written(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.op(OpType::Read).ok, 1000);
        assert_eq!(snap.bytes_written, 1000);
    }
}
