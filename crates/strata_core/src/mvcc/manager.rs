//! Transaction manager: ID issue, commit watermark and snapshot registry.

use crate::types::{Lsn, TransactionId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Registry {
    /// Active transactions and the LSN of their first logged write.
    active: HashMap<TransactionId, Option<Lsn>>,
    /// Multiset of snapshots held by transactions and readers.
    snapshots: BTreeMap<TransactionId, usize>,
}

impl Registry {
    fn hold(&mut self, snapshot: TransactionId) {
        *self.snapshots.entry(snapshot).or_insert(0) += 1;
    }

    fn release(&mut self, snapshot: TransactionId) {
        if let Some(count) = self.snapshots.get_mut(&snapshot) {
            *count -= 1;
            if *count == 0 {
                self.snapshots.remove(&snapshot);
            }
        }
    }
}

/// Issues transaction and commit IDs for one database and tracks which
/// snapshots are still in use.
///
/// A single counter issues both kinds of ID. The watermark is the newest
/// commit whose versions are installed; new snapshots take it as their
/// `snapshot_tx`. Commits are serialized by [`TransactionManager::commit_lock`].
#[derive(Debug)]
pub struct TransactionManager {
    next_id: AtomicU64,
    watermark: AtomicU64,
    registry: Mutex<Registry>,
    commit_lock: Mutex<()>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    /// A manager for an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::restore(1, TransactionId::ZERO)
    }

    /// A manager resuming after recovery.
    #[must_use]
    pub fn restore(next_id: u64, watermark: TransactionId) -> Self {
        Self {
            next_id: AtomicU64::new(next_id.max(watermark.as_u64() + 1)),
            watermark: AtomicU64::new(watermark.as_u64()),
            registry: Mutex::new(Registry::default()),
            commit_lock: Mutex::new(()),
        }
    }

    /// Registers a new transaction; returns its ID and snapshot.
    ///
    /// The snapshot is read and registered under the registry lock, so a
    /// concurrent [`TransactionManager::oldest_snapshot`] never misses it.
    pub fn begin(&self) -> (TransactionId, TransactionId) {
        let id = TransactionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut registry = self.registry.lock();
        let snapshot = self.watermark();
        registry.active.insert(id, None);
        registry.hold(snapshot);
        (id, snapshot)
    }

    /// Registers a read-only snapshot at the current watermark.
    pub fn snapshot(self: &Arc<Self>) -> Snapshot {
        let mut registry = self.registry.lock();
        let tx = self.watermark();
        registry.hold(tx);
        Snapshot {
            tx,
            manager: Arc::clone(self),
        }
    }

    pub(crate) fn note_first_lsn(&self, id: TransactionId, lsn: Lsn) {
        if let Some(first) = self.registry.lock().active.get_mut(&id) {
            first.get_or_insert(lsn);
        }
    }

    /// Removes a committed or aborted transaction from the registry.
    pub(crate) fn finish(&self, id: TransactionId, snapshot: TransactionId) {
        let mut registry = self.registry.lock();
        if registry.active.remove(&id).is_some() {
            registry.release(snapshot);
        }
    }

    fn release_snapshot(&self, snapshot: TransactionId) {
        self.registry.lock().release(snapshot);
    }

    /// Serializes commits (and checkpoints) of this database.
    pub fn commit_lock(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Draws the next commit ID. Call with the commit lock held.
    pub(crate) fn next_commit_id(&self) -> TransactionId {
        TransactionId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Makes `commit` the visible watermark. Call with the commit lock held.
    pub(crate) fn publish(&self, commit: TransactionId) {
        self.watermark.fetch_max(commit.as_u64(), Ordering::SeqCst);
    }

    /// Newest installed commit.
    #[must_use]
    pub fn watermark(&self) -> TransactionId {
        TransactionId::new(self.watermark.load(Ordering::SeqCst))
    }

    /// The next ID the counter will issue.
    #[must_use]
    pub fn peek_next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Oldest snapshot still held, or the watermark when none is.
    ///
    /// Compaction may drop versions deleted at or before this value.
    #[must_use]
    pub fn oldest_snapshot(&self) -> TransactionId {
        let registry = self.registry.lock();
        registry
            .snapshots
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.watermark())
    }

    /// First logged LSN of the oldest in-flight transaction that wrote.
    #[must_use]
    pub fn oldest_first_lsn(&self) -> Option<Lsn> {
        self.registry.lock().active.values().flatten().min().copied()
    }

    /// Active transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.registry.lock().active.len()
    }

    /// Snapshots held by transactions and readers.
    #[must_use]
    pub fn held_snapshots(&self) -> usize {
        self.registry.lock().snapshots.values().sum()
    }
}

/// A registered read snapshot; unregisters on drop.
#[derive(Debug)]
pub struct Snapshot {
    tx: TransactionId,
    manager: Arc<TransactionManager>,
}

impl Snapshot {
    /// The commit watermark this snapshot reads at.
    #[must_use]
    pub fn tx(&self) -> TransactionId {
        self.tx
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.manager.release_snapshot(self.tx);
    }
}
