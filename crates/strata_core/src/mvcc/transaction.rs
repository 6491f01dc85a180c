//! Transaction handles and their write sets.

use crate::error::{CoreError, CoreResult};
use crate::memory::MemoryGovernor;
use crate::mvcc::manager::TransactionManager;
use crate::types::{DatabaseId, DocumentId, Lsn, TransactionId};
use crate::wal::OpType;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting operations.
    Active,
    /// Commit succeeded.
    Committed,
    /// Aborted explicitly, by a failed commit or by being dropped.
    Aborted,
}

/// Final effect of a transaction on one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Install a new version.
    Put {
        /// New payload.
        payload: Vec<u8>,
        /// Operation that produced it.
        op: OpType,
    },
    /// Tombstone the live version.
    Delete,
}

/// Writes of one transaction, collapsed to the last write per document.
///
/// Both the commit path and WAL replay build their changes through this
/// type, so a recovered index matches the one that was live.
#[derive(Debug, Default)]
pub struct WriteSet {
    writes: Vec<(String, DocumentId, WriteOp)>,
    positions: HashMap<(String, DocumentId), usize>,
}

impl WriteSet {
    /// Records a write, replacing any earlier write to the same document.
    pub fn record(&mut self, collection: &str, doc_id: DocumentId, write: WriteOp) {
        let key = (collection.to_string(), doc_id);
        match self.positions.get(&key) {
            Some(&pos) => self.writes[pos].2 = write,
            None => {
                self.positions.insert(key, self.writes.len());
                self.writes.push((collection.to_string(), doc_id, write));
            }
        }
    }

    /// Records the write a WAL record describes; other records are ignored.
    pub fn record_wal(&mut self, op: OpType, collection: &str, doc_id: DocumentId, payload: Vec<u8>) {
        match op {
            OpType::Create | OpType::Update | OpType::Patch => {
                self.record(collection, doc_id, WriteOp::Put { payload, op });
            }
            OpType::Delete => self.record(collection, doc_id, WriteOp::Delete),
            _ => {}
        }
    }

    /// The pending write to a document, if any.
    #[must_use]
    pub fn get(&self, collection: &str, doc_id: DocumentId) -> Option<&WriteOp> {
        self.positions
            .get(&(collection.to_string(), doc_id))
            .map(|&pos| &self.writes[pos].2)
    }

    /// Writes in first-touch order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, DocumentId, &WriteOp)> {
        self.writes
            .iter()
            .map(|(collection, doc_id, write)| (collection.as_str(), *doc_id, write))
    }

    /// Number of distinct documents written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Payload bytes the collapsed writes will install.
    #[must_use]
    pub fn installed_bytes(&self) -> u64 {
        self.writes
            .iter()
            .map(|(_, _, write)| match write {
                WriteOp::Put { payload, .. } => payload.len() as u64,
                WriteOp::Delete => 0,
            })
            .sum()
    }
}

/// A snapshot-isolated transaction on one logical database.
///
/// Writes are buffered here and logged as they happen; they become visible
/// to others only when [`crate::LogicalDatabase::commit`] succeeds.
/// Dropping an active transaction aborts it.
pub struct Transaction {
    id: TransactionId,
    snapshot: TransactionId,
    started_at: Instant,
    state: TransactionState,
    writes: WriteSet,
    first_lsn: Option<Lsn>,
    charged: u64,
    db_id: DatabaseId,
    manager: Arc<TransactionManager>,
    governor: Arc<MemoryGovernor>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot)
            .field("state", &self.state)
            .field("writes", &self.writes.len())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        snapshot: TransactionId,
        db_id: DatabaseId,
        manager: Arc<TransactionManager>,
        governor: Arc<MemoryGovernor>,
    ) -> Self {
        Self {
            id,
            snapshot,
            started_at: Instant::now(),
            state: TransactionState::Active,
            writes: WriteSet::default(),
            first_lsn: None,
            charged: 0,
            db_id,
            manager,
            governor,
        }
    }

    /// Transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Latest commit visible to this transaction.
    #[must_use]
    pub fn snapshot(&self) -> TransactionId {
        self.snapshot
    }

    /// When the transaction began.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Whether the transaction still accepts operations.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Buffered writes.
    #[must_use]
    pub fn writes(&self) -> &WriteSet {
        &self.writes
    }

    pub(crate) fn ensure_active(&self) -> CoreResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(format!(
                "{} is {:?}",
                self.id, self.state
            )))
        }
    }

    /// Registers a lower bound for the LSN of this transaction's first
    /// record. Called before the record is appended, so a concurrent
    /// checkpoint never drops a segment this transaction still needs.
    pub(crate) fn reserve_first_lsn(&mut self, floor: Lsn) {
        if self.first_lsn.is_none() {
            self.first_lsn = Some(floor);
            self.manager.note_first_lsn(self.id, floor);
        }
    }

    /// Records a logged write and its memory charge.
    pub(crate) fn push_write(
        &mut self,
        collection: &str,
        doc_id: DocumentId,
        write: WriteOp,
        lsn: Lsn,
        charged: u64,
    ) {
        if self.first_lsn.is_none() {
            self.first_lsn = Some(lsn);
            self.manager.note_first_lsn(self.id, lsn);
        }
        self.charged += charged;
        self.writes.record(collection, doc_id, write);
    }

    /// Marks the transaction committed; returns the bytes still charged
    /// beyond what the installed versions hold.
    pub(crate) fn finish_commit(&mut self) -> u64 {
        self.state = TransactionState::Committed;
        self.manager.finish(self.id, self.snapshot);
        let surplus = self.charged.saturating_sub(self.writes.installed_bytes());
        self.charged = 0;
        surplus
    }

    /// Marks the transaction aborted and releases its memory charge.
    pub(crate) fn finish_abort(&mut self) {
        if !self.is_active() {
            return;
        }
        self.state = TransactionState::Aborted;
        self.manager.finish(self.id, self.snapshot);
        if self.charged > 0 {
            self.governor.free(self.db_id, self.charged);
            self.charged = 0;
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.finish_abort();
    }
}
