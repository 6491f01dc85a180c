//! Logical database: recovery, transactions and maintenance.

use crate::checkpoint::{self, CheckpointCollection, CheckpointData, CheckpointDocument};
use crate::config::Config;
use crate::dir::{database_path, wal_path};
use crate::error::{CoreError, CoreResult, ErrorCategory, Missing};
use crate::memory::{BufferPool, DbMemoryUsage, MemoryGovernor};
use crate::mvcc::{
    CollectionMetadata, CompactionReport, Snapshot, Transaction, TransactionManager,
    VersionIndex, WriteOp, WriteSet,
};
use crate::scheduler::{Request, Response};
use crate::stats::{DatabaseStats, StatsSnapshot};
use crate::types::{unix_millis, DatabaseId, DocumentId, Lsn, TransactionId, DEFAULT_COLLECTION};
use crate::wal::{OpType, SegmentInfo, Wal, WalRecord, MAX_COLLECTION_LEN};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// One logical database: a WAL, a version index and a transaction manager.
///
/// Every mutation is logged when it executes and becomes visible when its
/// transaction commits. Opening a database replays its newest checkpoint and
/// the WAL after it.
///
/// ```rust,ignore
/// let db = LogicalDatabase::open(id, "app", &config, governor, buffers)?;
/// db.create("_default", 1, b"Hello, World!".to_vec())?;
/// assert_eq!(db.read("_default", 1)?, b"Hello, World!");
///
/// db.transaction(|txn| {
///     db.update_in_txn(txn, "_default", 1, b"Updated message".to_vec())?;
///     db.create_in_txn(txn, "_default", 2, b"second".to_vec())
/// })?;
/// db.close()?;
/// ```
pub struct LogicalDatabase {
    id: DatabaseId,
    name: String,
    path: PathBuf,
    config: Config,
    wal: Wal,
    index: RwLock<VersionIndex>,
    txns: Arc<TransactionManager>,
    governor: Arc<MemoryGovernor>,
    stats: DatabaseStats,
    is_open: RwLock<bool>,
}

/// Records of one transaction seen during replay, waiting for its commit.
#[derive(Default)]
struct PendingTx {
    writes: WriteSet,
    collections: Vec<WalRecord>,
}

/// State rebuilt from a checkpoint and the WAL.
struct Recovery<'a> {
    db: DatabaseId,
    governor: &'a MemoryGovernor,
    index: VersionIndex,
    watermark: TransactionId,
    max_id: u64,
}

impl<'a> Recovery<'a> {
    fn new(db: DatabaseId, governor: &'a MemoryGovernor) -> Self {
        Self {
            db,
            governor,
            index: VersionIndex::new(),
            watermark: TransactionId::ZERO,
            max_id: 0,
        }
    }

    fn charge(&self, bytes: u64) -> CoreResult<()> {
        if bytes == 0 || self.governor.try_allocate_replay(self.db, bytes) {
            Ok(())
        } else {
            Err(CoreError::MemoryLimit {
                db: self.db,
                requested: bytes,
            })
        }
    }

    fn load_checkpoint(&mut self, data: CheckpointData) -> CoreResult<()> {
        self.watermark = data.watermark;
        self.max_id = data.next_id.saturating_sub(1).max(data.watermark.as_u64());
        for collection in data.collections {
            if collection.name == DEFAULT_COLLECTION {
                continue;
            }
            self.index
                .create_collection(&collection.name, collection.created_tx, collection.created_at)?;
        }
        for doc in data.documents {
            self.charge(doc.payload.len() as u64)?;
            let write = WriteOp::Put {
                payload: doc.payload,
                op: OpType::Create,
            };
            self.index
                .install(&doc.collection, doc.doc_id, &write, doc.created_tx)?;
        }
        Ok(())
    }

    /// Applies every transaction whose commit record lies after `cut`, in
    /// commit order. Returns the number of transactions applied.
    fn replay(&mut self, records: Vec<WalRecord>, cut: Lsn) -> CoreResult<u64> {
        let mut pending: HashMap<TransactionId, PendingTx> = HashMap::new();
        let mut applied = 0;

        for record in records {
            self.max_id = self.max_id.max(record.tx_id.as_u64());
            match record.op {
                OpType::Commit => {
                    let commit = TransactionId::new(record.marker_value()?);
                    self.max_id = self.max_id.max(commit.as_u64());
                    let group = pending.remove(&record.tx_id).unwrap_or_default();
                    if record.lsn > cut {
                        self.apply(group, commit)?;
                        applied += 1;
                    }
                }
                OpType::Checkpoint | OpType::Read => {}
                OpType::CreateCollection | OpType::DeleteCollection => {
                    pending.entry(record.tx_id).or_default().collections.push(record);
                }
                OpType::Create | OpType::Update | OpType::Delete | OpType::Patch => {
                    pending.entry(record.tx_id).or_default().writes.record_wal(
                        record.op,
                        &record.collection,
                        record.doc_id,
                        record.payload,
                    );
                }
            }
        }

        if !pending.is_empty() {
            tracing::debug!(
                db = %self.db,
                discarded = pending.len(),
                "discarding uncommitted transactions"
            );
        }
        Ok(applied)
    }

    fn apply(&mut self, group: PendingTx, commit: TransactionId) -> CoreResult<()> {
        for record in group.collections {
            if record.op == OpType::CreateCollection {
                self.index
                    .create_collection(&record.collection, commit, record.marker_value()?)?;
            } else {
                self.index.drop_collection(&record.collection, commit)?;
            }
        }
        for (collection, doc_id, write) in group.writes.iter() {
            if let WriteOp::Put { payload, .. } = write {
                self.charge(payload.len() as u64)?;
            }
            self.index.install(collection, doc_id, write, commit)?;
        }
        self.watermark = self.watermark.max(commit);
        Ok(())
    }
}

fn validate_collection_name(name: &str) -> CoreResult<()> {
    if name.is_empty() {
        return Err(CoreError::invalid_argument("collection name is empty"));
    }
    if name.len() > MAX_COLLECTION_LEN {
        return Err(CoreError::invalid_argument(format!(
            "collection name is {} bytes, limit is {MAX_COLLECTION_LEN}",
            name.len()
        )));
    }
    Ok(())
}

fn document_not_found(collection: &str, doc_id: DocumentId) -> CoreError {
    CoreError::not_found(Missing::Document, format!("{collection}/{doc_id}"))
}

impl LogicalDatabase {
    /// Opens database `id`, recovering it from its checkpoint and WAL.
    ///
    /// The database is registered with `governor` for the lifetime of the
    /// handle. Replayed versions are charged to the replay budget and folded
    /// into normal usage once recovery succeeds.
    ///
    /// # Errors
    ///
    /// `Corruption` for WAL damage outside a torn tail, `MemoryLimit` if the
    /// recovered state does not fit the replay budget.
    pub fn open(
        id: DatabaseId,
        name: &str,
        config: &Config,
        governor: Arc<MemoryGovernor>,
        buffers: Arc<BufferPool>,
    ) -> CoreResult<Self> {
        let path = database_path(&config.data_dir, id);
        std::fs::create_dir_all(&path)?;
        governor.register_db(id, config.per_db_memory_bytes);

        match Self::recover(id, name, path, config, Arc::clone(&governor), buffers) {
            Ok(db) => Ok(db),
            Err(err) => {
                governor.unregister_db(id);
                if err.category() == ErrorCategory::Corruption {
                    tracing::error!(db = %id, name, error = %err, "recovery failed");
                }
                Err(err)
            }
        }
    }

    fn recover(
        id: DatabaseId,
        name: &str,
        path: PathBuf,
        config: &Config,
        governor: Arc<MemoryGovernor>,
        buffers: Arc<BufferPool>,
    ) -> CoreResult<Self> {
        let started = Instant::now();
        let budget = governor.set_replay_budget(
            id,
            config.replay_budget_bytes.unwrap_or(0),
            config.per_db_memory_bytes,
        )?;

        let checkpoint = checkpoint::load_latest(&path, id)?;
        let cut = checkpoint.as_ref().map_or(Lsn::ZERO, |c| c.cut);
        let (wal, replay) = Wal::open(
            &wal_path(&config.data_dir, id),
            id,
            config.wal_segment_size,
            buffers,
            cut.next(),
        )?;

        let mut recovery = Recovery::new(id, &governor);
        let checkpoint_next_id = checkpoint.as_ref().map_or(1, |c| c.next_id);
        if let Some(data) = checkpoint {
            recovery.load_checkpoint(data)?;
        }
        let replayed_records = replay.records.len() as u64;
        let applied = recovery.replay(replay.records, cut)?;
        let replay_bytes = governor.merge_replay_usage(id);

        let next_id = checkpoint_next_id.max(recovery.max_id + 1);
        let txns = Arc::new(TransactionManager::restore(next_id, recovery.watermark));
        let stats = DatabaseStats::new();
        stats.record_replayed(replayed_records);

        tracing::info!(
            db = %id,
            name,
            checkpoint = %cut,
            transactions = applied,
            torn_tail = replay.torn_tail,
            replay_bytes,
            budget,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "database opened"
        );

        Ok(Self {
            id,
            name: name.to_string(),
            path,
            config: config.clone(),
            wal,
            index: RwLock::new(recovery.index),
            txns,
            governor,
            stats,
            is_open: RwLock::new(true),
        })
    }

    /// Database ID.
    #[must_use]
    pub fn id(&self) -> DatabaseId {
        self.id
    }

    /// Catalog name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the WAL and checkpoints.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begins a transaction at the current watermark.
    pub fn begin(&self) -> CoreResult<Transaction> {
        self.ensure_open()?;
        let (id, snapshot) = self.txns.begin();
        self.stats.record_transaction_start();
        Ok(Transaction::new(
            id,
            snapshot,
            self.id,
            Arc::clone(&self.txns),
            Arc::clone(&self.governor),
        ))
    }

    /// Commits a transaction and returns its commit ID.
    ///
    /// # Errors
    ///
    /// `Conflict` if another transaction committed a write to one of the
    /// same documents after this one's snapshot. The transaction is aborted
    /// on any error.
    pub fn commit(&self, txn: &mut Transaction) -> CoreResult<TransactionId> {
        self.commit_checked(txn, || true)
    }

    /// Aborts a transaction. Nothing it wrote becomes visible.
    pub fn abort(&self, txn: &mut Transaction) -> CoreResult<()> {
        txn.ensure_active()?;
        self.abort_active(txn);
        Ok(())
    }

    /// Runs `f` in a transaction, committing on `Ok` and aborting on `Err`.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction) -> CoreResult<T>,
    {
        self.auto_commit(f, || true).map(|(value, _)| value)
    }

    fn auto_commit<F, T>(
        &self,
        f: F,
        may_commit: impl FnOnce() -> bool,
    ) -> CoreResult<(T, TransactionId)>
    where
        F: FnOnce(&mut Transaction) -> CoreResult<T>,
    {
        let mut txn = self.begin()?;
        match f(&mut txn) {
            Ok(value) => {
                let commit = self.commit_checked(&mut txn, may_commit)?;
                Ok((value, commit))
            }
            Err(err) => {
                self.abort_active(&mut txn);
                Err(err)
            }
        }
    }

    fn abort_active(&self, txn: &mut Transaction) {
        if txn.is_active() {
            txn.finish_abort();
            self.stats.record_transaction_abort();
            tracing::debug!(db = %self.id, txn = %txn.id(), "transaction aborted");
        }
    }

    /// Commits `txn` unless `may_commit` returns false once the conflict
    /// check has passed, in which case it is aborted with `Timeout`.
    pub(crate) fn commit_checked(
        &self,
        txn: &mut Transaction,
        may_commit: impl FnOnce() -> bool,
    ) -> CoreResult<TransactionId> {
        self.ensure_open()?;
        txn.ensure_active()?;

        if txn.writes().is_empty() {
            txn.finish_commit();
            self.stats.record_transaction_commit();
            return Ok(txn.snapshot());
        }

        let result = {
            let _guard = self.txns.commit_lock();
            self.commit_locked(txn, may_commit)
        };

        match result {
            Ok(commit) => {
                let surplus = txn.finish_commit();
                if surplus > 0 {
                    self.governor.free(self.id, surplus);
                }
                self.stats.record_transaction_commit();
                self.stats.record_latency(txn.started_at().elapsed());
                tracing::trace!(db = %self.id, txn = %txn.id(), commit = %commit, "committed");
                Ok(commit)
            }
            Err(err) => {
                self.abort_active(txn);
                self.stats.record_error(err.category());
                Err(err)
            }
        }
    }

    fn commit_locked(
        &self,
        txn: &Transaction,
        may_commit: impl FnOnce() -> bool,
    ) -> CoreResult<TransactionId> {
        self.check_conflicts(txn)?;
        if !may_commit() {
            return Err(CoreError::Timeout);
        }

        let commit = self.txns.next_commit_id();
        self.wal
            .append(&mut WalRecord::commit(self.id, txn.id(), commit))?;
        self.sync_commit()?;

        let mut index = self.index.write();
        for (collection, doc_id, write) in txn.writes().iter() {
            index.install(collection, doc_id, write, commit)?;
        }
        self.txns.publish(commit);
        Ok(commit)
    }

    /// First-committer-wins: a write conflicts when the document's newest
    /// version was created or deleted after the writer's snapshot, or when
    /// its collection was dropped since.
    fn check_conflicts(&self, txn: &Transaction) -> CoreResult<()> {
        let index = self.index.read();
        let snapshot = txn.snapshot();
        for (collection, doc_id, _) in txn.writes().iter() {
            if !index.current_visible(collection, snapshot) {
                return Err(CoreError::conflict(collection, doc_id));
            }
            if let Some(latest) = index.latest(collection, doc_id) {
                let newer = latest.created_tx > snapshot
                    || latest.deleted_tx.is_some_and(|deleted| deleted > snapshot);
                if newer {
                    return Err(CoreError::conflict(collection, doc_id));
                }
            }
        }
        Ok(())
    }

    /// Syncs a just-appended commit record when configured to.
    ///
    /// A failed sync leaves the commit's durability unknown, so the handle
    /// is closed; reopening recovers whatever reached the disk.
    fn sync_commit(&self) -> CoreResult<()> {
        if !self.config.sync_on_commit {
            return Ok(());
        }
        self.wal.sync().map_err(|err| {
            tracing::error!(db = %self.id, error = %err, "WAL sync failed; closing database");
            self.mark_closed();
            err
        })
    }

    // ========================================================================
    // Document operations
    // ========================================================================

    fn observe<T>(&self, op: OpType, result: CoreResult<T>) -> CoreResult<T> {
        self.stats.record_op(op, result.is_ok());
        if let Err(err) = &result {
            self.stats.record_error(err.category());
        }
        result
    }

    /// Looks at the document as `txn` sees it: its own writes first, then
    /// the committed state at its snapshot.
    fn probe<T>(
        &self,
        txn: &Transaction,
        collection: &str,
        doc_id: DocumentId,
        f: impl FnOnce(Option<&[u8]>) -> T,
    ) -> CoreResult<T> {
        if let Some(write) = txn.writes().get(collection, doc_id) {
            return Ok(match write {
                WriteOp::Put { payload, .. } => f(Some(payload)),
                WriteOp::Delete => f(None),
            });
        }
        let index = self.index.read();
        if !index.collection_visible(collection, txn.snapshot()) {
            return Err(CoreError::not_found(Missing::Collection, collection));
        }
        Ok(f(index.read(collection, doc_id, txn.snapshot())))
    }

    fn mutate(
        &self,
        txn: &mut Transaction,
        op: OpType,
        collection: &str,
        doc_id: DocumentId,
        input: Vec<u8>,
    ) -> CoreResult<()> {
        self.ensure_open()?;
        txn.ensure_active()?;

        let payload = match op {
            OpType::Create => {
                if self.probe(txn, collection, doc_id, |p| p.is_some())? {
                    return Err(CoreError::already_exists(format!("{collection}/{doc_id}")));
                }
                input
            }
            OpType::Update => {
                if !self.probe(txn, collection, doc_id, |p| p.is_some())? {
                    return Err(document_not_found(collection, doc_id));
                }
                input
            }
            OpType::Delete => {
                if !self.probe(txn, collection, doc_id, |p| p.is_some())? {
                    return Err(document_not_found(collection, doc_id));
                }
                Vec::new()
            }
            OpType::Patch => self
                .probe(txn, collection, doc_id, |current| {
                    current.map(|current| apply_merge_patch(current, &input))
                })?
                .ok_or_else(|| document_not_found(collection, doc_id))??,
            other => {
                return Err(CoreError::invalid_argument(format!(
                    "{other} is not a document write"
                )))
            }
        };
        self.log_write(txn, op, collection, doc_id, payload)
    }

    /// Charges, logs and buffers one write.
    fn log_write(
        &self,
        txn: &mut Transaction,
        op: OpType,
        collection: &str,
        doc_id: DocumentId,
        payload: Vec<u8>,
    ) -> CoreResult<()> {
        let charge = payload.len() as u64;
        if charge > 0 {
            self.governor.allocate(self.id, charge)?;
        }

        txn.reserve_first_lsn(self.wal.current_lsn().next());
        let mut record = WalRecord::document(self.id, txn.id(), op, collection, doc_id, payload);
        let frame_len = record.frame_len() as u64;
        let lsn = match self.wal.append(&mut record) {
            Ok(lsn) => lsn,
            Err(err) => {
                self.governor.free(self.id, charge);
                return Err(err);
            }
        };

        let write = match op {
            OpType::Delete => WriteOp::Delete,
            _ => WriteOp::Put {
                payload: std::mem::take(&mut record.payload),
                op,
            },
        };
        txn.push_write(collection, doc_id, write, lsn, charge);
        self.stats.record_bytes_written(frame_len);
        Ok(())
    }

    /// Creates a document in `txn`.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the document is visible to `txn`.
    pub fn create_in_txn(
        &self,
        txn: &mut Transaction,
        collection: &str,
        doc_id: DocumentId,
        payload: Vec<u8>,
    ) -> CoreResult<()> {
        let result = self.mutate(txn, OpType::Create, collection, doc_id, payload);
        self.observe(OpType::Create, result)
    }

    /// Reads a document as `txn` sees it.
    ///
    /// # Errors
    ///
    /// `NotFound` if the document or its collection is not visible.
    pub fn read_in_txn(
        &self,
        txn: &Transaction,
        collection: &str,
        doc_id: DocumentId,
    ) -> CoreResult<Vec<u8>> {
        let result = self.ensure_open().and_then(|()| {
            txn.ensure_active()?;
            self.probe(txn, collection, doc_id, |p| p.map(<[u8]>::to_vec))?
                .ok_or_else(|| document_not_found(collection, doc_id))
        });
        if let Ok(payload) = &result {
            self.stats.record_bytes_read(payload.len() as u64);
        }
        self.observe(OpType::Read, result)
    }

    /// Replaces a document's payload in `txn`.
    pub fn update_in_txn(
        &self,
        txn: &mut Transaction,
        collection: &str,
        doc_id: DocumentId,
        payload: Vec<u8>,
    ) -> CoreResult<()> {
        let result = self.mutate(txn, OpType::Update, collection, doc_id, payload);
        self.observe(OpType::Update, result)
    }

    /// Applies a JSON merge patch to a document in `txn` and returns the
    /// merged document.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` unless the document and the patch are JSON objects.
    pub fn patch_in_txn(
        &self,
        txn: &mut Transaction,
        collection: &str,
        doc_id: DocumentId,
        patch: &[u8],
    ) -> CoreResult<Vec<u8>> {
        let result = self
            .mutate(txn, OpType::Patch, collection, doc_id, patch.to_vec())
            .map(|()| match txn.writes().get(collection, doc_id) {
                Some(WriteOp::Put { payload, .. }) => payload.clone(),
                _ => Vec::new(),
            });
        self.observe(OpType::Patch, result)
    }

    /// Deletes a document in `txn`.
    pub fn delete_in_txn(
        &self,
        txn: &mut Transaction,
        collection: &str,
        doc_id: DocumentId,
    ) -> CoreResult<()> {
        let result = self.mutate(txn, OpType::Delete, collection, doc_id, Vec::new());
        self.observe(OpType::Delete, result)
    }

    /// Creates a document in its own transaction.
    pub fn create(
        &self,
        collection: &str,
        doc_id: DocumentId,
        payload: Vec<u8>,
    ) -> CoreResult<TransactionId> {
        self.auto_commit(|txn| self.create_in_txn(txn, collection, doc_id, payload), || true)
            .map(|((), commit)| commit)
    }

    /// Reads the latest committed version of a document.
    pub fn read(&self, collection: &str, doc_id: DocumentId) -> CoreResult<Vec<u8>> {
        let result = self.ensure_open().and_then(|()| {
            let index = self.index.read();
            let snapshot = self.txns.watermark();
            Self::read_locked(&index, collection, doc_id, snapshot)
        });
        if let Ok(payload) = &result {
            self.stats.record_bytes_read(payload.len() as u64);
        }
        self.observe(OpType::Read, result)
    }

    /// Reads a document at a registered snapshot.
    pub fn read_at(
        &self,
        snapshot: &Snapshot,
        collection: &str,
        doc_id: DocumentId,
    ) -> CoreResult<Vec<u8>> {
        self.ensure_open()?;
        let index = self.index.read();
        Self::read_locked(&index, collection, doc_id, snapshot.tx())
    }

    fn read_locked(
        index: &VersionIndex,
        collection: &str,
        doc_id: DocumentId,
        snapshot: TransactionId,
    ) -> CoreResult<Vec<u8>> {
        if !index.collection_visible(collection, snapshot) {
            return Err(CoreError::not_found(Missing::Collection, collection));
        }
        index
            .read(collection, doc_id, snapshot)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| document_not_found(collection, doc_id))
    }

    /// Replaces a document in its own transaction.
    pub fn update(
        &self,
        collection: &str,
        doc_id: DocumentId,
        payload: Vec<u8>,
    ) -> CoreResult<TransactionId> {
        self.auto_commit(|txn| self.update_in_txn(txn, collection, doc_id, payload), || true)
            .map(|((), commit)| commit)
    }

    /// Merge-patches a document in its own transaction; returns the merged
    /// document.
    pub fn patch(&self, collection: &str, doc_id: DocumentId, patch: &[u8]) -> CoreResult<Vec<u8>> {
        self.auto_commit(|txn| self.patch_in_txn(txn, collection, doc_id, patch), || true)
            .map(|(merged, _)| merged)
    }

    /// Deletes a document in its own transaction.
    pub fn delete(&self, collection: &str, doc_id: DocumentId) -> CoreResult<TransactionId> {
        self.auto_commit(|txn| self.delete_in_txn(txn, collection, doc_id), || true)
            .map(|((), commit)| commit)
    }

    /// Runs one scheduled request as an auto-committed transaction.
    ///
    /// `may_commit` is consulted after the conflict check and before the
    /// commit record is written; returning false aborts with `Timeout`.
    pub fn execute(
        &self,
        request: &Request,
        may_commit: impl FnOnce() -> bool,
    ) -> CoreResult<Response> {
        let started = Instant::now();
        let collection = request.collection.as_str();
        let doc_id = request.doc_id;
        let response = match request.op {
            OpType::Read => Response {
                op: request.op,
                payload: Some(self.read(collection, doc_id)?),
                commit: None,
            },
            OpType::Create | OpType::Update | OpType::Delete | OpType::Patch => {
                let (payload, commit) = self.auto_commit(
                    |txn| match request.op {
                        OpType::Create => self
                            .create_in_txn(txn, collection, doc_id, request.payload.clone())
                            .map(|()| None),
                        OpType::Update => self
                            .update_in_txn(txn, collection, doc_id, request.payload.clone())
                            .map(|()| None),
                        OpType::Patch => self
                            .patch_in_txn(txn, collection, doc_id, &request.payload)
                            .map(Some),
                        _ => self.delete_in_txn(txn, collection, doc_id).map(|()| None),
                    },
                    may_commit,
                )?;
                Response {
                    op: request.op,
                    payload,
                    commit: Some(commit),
                }
            }
            OpType::CreateCollection | OpType::DeleteCollection => {
                let commit = self.collection_op(request.op, collection, may_commit)?;
                Response {
                    op: request.op,
                    payload: None,
                    commit: Some(commit),
                }
            }
            OpType::Checkpoint => {
                self.checkpoint()?;
                Response {
                    op: request.op,
                    payload: None,
                    commit: None,
                }
            }
            OpType::Commit => {
                return Err(CoreError::invalid_argument(
                    "commit is implied by every request",
                ))
            }
        };
        self.stats.record_latency(started.elapsed());
        Ok(response)
    }

    // ========================================================================
    // Collections
    // ========================================================================

    /// Creates a collection in its own transaction.
    pub fn create_collection(&self, name: &str) -> CoreResult<TransactionId> {
        self.collection_op(OpType::CreateCollection, name, || true)
    }

    /// Drops a collection, tombstoning every live document in it.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for the default collection, `NotFound` if absent.
    pub fn drop_collection(&self, name: &str) -> CoreResult<TransactionId> {
        self.collection_op(OpType::DeleteCollection, name, || true)
    }

    fn collection_op(
        &self,
        op: OpType,
        name: &str,
        may_commit: impl FnOnce() -> bool,
    ) -> CoreResult<TransactionId> {
        let result = self.collection_op_inner(op, name, may_commit);
        self.observe(op, result)
    }

    fn collection_op_inner(
        &self,
        op: OpType,
        name: &str,
        may_commit: impl FnOnce() -> bool,
    ) -> CoreResult<TransactionId> {
        self.ensure_open()?;
        validate_collection_name(name)?;
        if op == OpType::DeleteCollection && name == DEFAULT_COLLECTION {
            return Err(CoreError::invalid_argument(
                "the default collection cannot be dropped",
            ));
        }

        let _guard = self.txns.commit_lock();
        let exists = self.index.read().has_collection(name);
        match op {
            OpType::CreateCollection if exists => {
                return Err(CoreError::already_exists(format!("collection {name}")))
            }
            OpType::DeleteCollection if !exists => {
                return Err(CoreError::not_found(Missing::Collection, name))
            }
            _ => {}
        }
        if !may_commit() {
            return Err(CoreError::Timeout);
        }

        let mut txn = self.begin()?;
        let created_at = unix_millis();
        let payload = if op == OpType::CreateCollection {
            created_at.to_le_bytes().to_vec()
        } else {
            Vec::new()
        };
        self.wal
            .append(&mut WalRecord::document(self.id, txn.id(), op, name, 0, payload))?;
        let commit = self.txns.next_commit_id();
        self.wal
            .append(&mut WalRecord::commit(self.id, txn.id(), commit))?;
        self.sync_commit()?;

        {
            let mut index = self.index.write();
            if op == OpType::CreateCollection {
                index.create_collection(name, commit, created_at)?;
            } else {
                let tombstoned = index.drop_collection(name, commit)?;
                tracing::debug!(db = %self.id, collection = name, tombstoned, "collection dropped");
            }
            self.txns.publish(commit);
        }
        txn.finish_commit();
        self.stats.record_transaction_commit();
        Ok(commit)
    }

    /// Collections visible at the current watermark.
    pub fn collections(&self) -> CoreResult<Vec<CollectionMetadata>> {
        self.ensure_open()?;
        let index = self.index.read();
        Ok(index.collections(self.txns.watermark()))
    }

    /// Documents visible in `collection` at the current watermark.
    pub fn document_count(&self, collection: &str) -> CoreResult<usize> {
        self.ensure_open()?;
        let index = self.index.read();
        let snapshot = self.txns.watermark();
        if !index.collection_visible(collection, snapshot) {
            return Err(CoreError::not_found(Missing::Collection, collection));
        }
        Ok(index.document_count(collection, snapshot))
    }

    /// Registers a read snapshot at the current watermark.
    pub fn snapshot(&self) -> CoreResult<Snapshot> {
        self.ensure_open()?;
        Ok(self.txns.snapshot())
    }

    /// Document IDs of `collection` that may be visible at `snapshot`.
    pub(crate) fn candidate_ids(
        &self,
        snapshot: &Snapshot,
        collection: &str,
    ) -> CoreResult<Vec<DocumentId>> {
        self.ensure_open()?;
        let index = self.index.read();
        if !index.collection_visible(collection, snapshot.tx()) {
            return Err(CoreError::not_found(Missing::Collection, collection));
        }
        Ok(index.doc_ids(collection, snapshot.tx()))
    }

    /// The visible payload of a document, or `None`.
    pub(crate) fn visible_payload(
        &self,
        snapshot: &Snapshot,
        collection: &str,
        doc_id: DocumentId,
    ) -> Option<Vec<u8>> {
        let index = self.index.read();
        let payload = index.read(collection, doc_id, snapshot.tx()).map(<[u8]>::to_vec);
        if let Some(payload) = &payload {
            self.stats.record_bytes_read(payload.len() as u64);
        }
        payload
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Writes a checkpoint and trims the WAL behind it. Returns the cut.
    ///
    /// Segments are kept as long as the oldest retained checkpoint or any
    /// in-flight transaction may still need them.
    pub fn checkpoint(&self) -> CoreResult<Lsn> {
        self.ensure_open()?;
        let result = self.write_checkpoint();
        self.observe(OpType::Checkpoint, result)
    }

    fn write_checkpoint(&self) -> CoreResult<Lsn> {
        let _guard = self.txns.commit_lock();
        let cut = self.wal.current_lsn();
        let replay_from = self
            .txns
            .oldest_first_lsn()
            .map_or(cut.next(), |first| first.min(cut.next()));

        let data = {
            let index = self.index.read();
            CheckpointData {
                cut,
                replay_from,
                watermark: self.txns.watermark(),
                next_id: self.txns.peek_next_id(),
                collections: index
                    .live_collections()
                    .map(|(name, created_tx, created_at)| CheckpointCollection {
                        name: name.to_string(),
                        created_tx,
                        created_at,
                    })
                    .collect(),
                documents: index
                    .live_documents()
                    .map(|(collection, version, payload)| CheckpointDocument {
                        collection: collection.to_string(),
                        doc_id: version.doc_id,
                        created_tx: version.created_tx,
                        payload: payload.to_vec(),
                    })
                    .collect(),
            }
        };

        let file = checkpoint::write_checkpoint(&self.path, self.id, &data)?;
        self.wal.append(&mut WalRecord::checkpoint(self.id, cut))?;
        self.wal.sync()?;
        self.wal.rotate()?;

        let retained = checkpoint::prune_checkpoints(&self.path, self.config.checkpoint_retention)?;
        let mut floor = replay_from;
        if let Some((_, oldest)) = retained.first() {
            match checkpoint::read_replay_from(oldest) {
                Ok(oldest_from) => floor = floor.min(oldest_from),
                Err(err) => {
                    tracing::warn!(
                        db = %self.id,
                        checkpoint = %oldest.display(),
                        error = %err,
                        "cannot read retained checkpoint; keeping WAL segments"
                    );
                    self.stats.record_checkpoint();
                    return Ok(cut);
                }
            }
        }
        let removed = self.wal.remove_segments_before(floor)?;

        self.stats.record_checkpoint();
        tracing::info!(
            db = %self.id,
            cut = %cut,
            documents = data.documents.len(),
            removed_segments = removed,
            file = %file.display(),
            "checkpoint written"
        );
        Ok(cut)
    }

    /// Drops versions no registered snapshot can see and returns their
    /// memory to the governor.
    pub fn compact(&self) -> CoreResult<CompactionReport> {
        self.ensure_open()?;
        let floor = self.txns.oldest_snapshot();
        let report = self.index.write().compact(floor);
        if report.bytes_reclaimed > 0 {
            self.governor.free(self.id, report.bytes_reclaimed as u64);
        }
        self.stats.record_compaction(report.versions_removed as u64);
        tracing::debug!(
            db = %self.id,
            floor = %floor,
            removed = report.versions_removed,
            bytes = report.bytes_reclaimed,
            "compacted"
        );
        Ok(report)
    }

    /// Whether tombstones outnumber live versions by the configured ratio.
    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        let index = self.index.read();
        let tombstones = index.tombstone_count();
        tombstones > 0
            && tombstones as f64 / index.live_count().max(1) as f64
                >= self.config.compaction_threshold
    }

    /// Live and superseded versions currently held.
    #[must_use]
    pub fn version_counts(&self) -> (usize, usize) {
        let index = self.index.read();
        (index.live_count(), index.tombstone_count())
    }

    /// Newest committed ID.
    #[must_use]
    pub fn watermark(&self) -> TransactionId {
        self.txns.watermark()
    }

    /// Snapshots held by transactions and readers.
    #[must_use]
    pub fn held_snapshots(&self) -> usize {
        self.txns.held_snapshots()
    }

    /// Counters for this database.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Memory charged to this database, while it is open.
    #[must_use]
    pub fn memory_usage(&self) -> Option<DbMemoryUsage> {
        self.governor.usage(self.id)
    }

    /// The WAL's segment files.
    pub fn wal_segments(&self) -> CoreResult<Vec<SegmentInfo>> {
        self.wal.segments()
    }

    /// Closes the database: optionally checkpoints, syncs the WAL and
    /// releases its memory registration. Idempotent.
    pub fn close(&self) -> CoreResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        let checkpointed = if self.config.checkpoint_auto_create {
            self.write_checkpoint().map(drop)
        } else {
            Ok(())
        };

        {
            let mut is_open = self.is_open.write();
            if !*is_open {
                return Ok(());
            }
            *is_open = false;
        }
        let synced = self.wal.sync();
        self.governor.unregister_db(self.id);
        tracing::info!(db = %self.id, name = %self.name, "database closed");
        checkpointed.and(synced)
    }

    fn mark_closed(&self) {
        *self.is_open.write() = false;
        self.governor.unregister_db(self.id);
    }

    /// Whether the database accepts operations.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }
}

impl std::fmt::Debug for LogicalDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalDatabase")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("is_open", &self.is_open())
            .field("watermark", &self.watermark())
            .finish_non_exhaustive()
    }
}

impl Drop for LogicalDatabase {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Applies an RFC 7396 merge patch; both sides must be JSON objects.
pub fn apply_merge_patch(current: &[u8], patch: &[u8]) -> CoreResult<Vec<u8>> {
    let mut target: Value = serde_json::from_slice(current)
        .map_err(|e| CoreError::invalid_argument(format!("document is not JSON: {e}")))?;
    let patch: Value = serde_json::from_slice(patch)
        .map_err(|e| CoreError::invalid_argument(format!("patch is not JSON: {e}")))?;
    if !target.is_object() || !patch.is_object() {
        return Err(CoreError::invalid_argument(
            "patch needs a JSON object document and a JSON object patch",
        ));
    }
    merge(&mut target, &patch);
    serde_json::to_vec(&target)
        .map_err(|e| CoreError::invalid_argument(format!("cannot encode patched document: {e}")))
}

fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in entries {
            if value.is_null() {
                map.remove(key);
            } else {
                merge(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
