//! Request scheduling for one logical database.
//!
//! Requests enter a bounded queue and are drained by one worker
//! ([`WriterMode::SingleWriter`](crate::WriterMode::SingleWriter)) or by a
//! pool of workers sharing the queue in arrival order. Every request runs as
//! its own auto-committed transaction.
//!
//! A request carries a deadline. Submitters block while the queue is full
//! and give up with `Timeout` when the deadline passes; a request that is
//! still queued at its deadline is answered without running, and one that
//! is running is aborted before its commit record is written. A request is
//! therefore either fully committed or has no effect at all.

use crate::config::Config;
use crate::database::LogicalDatabase;
use crate::error::{CoreError, CoreResult};
use crate::types::{DatabaseId, DocumentId, TransactionId};
use crate::wal::OpType;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long a blocked submitter waits before retrying a full queue.
const ADMISSION_POLL: Duration = Duration::from_millis(1);

const PENDING: u8 = 0;
const COMMITTING: u8 = 1;
const CANCELLED: u8 = 2;

/// One operation submitted to a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Operation to run.
    pub op: OpType,
    /// Target collection.
    pub collection: String,
    /// Target document (ignored by collection operations).
    pub doc_id: DocumentId,
    /// Payload for create and update, merge patch for patch.
    pub payload: Vec<u8>,
}

impl Request {
    /// A request for any operation.
    pub fn new(
        op: OpType,
        collection: impl Into<String>,
        doc_id: DocumentId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            op,
            collection: collection.into(),
            doc_id,
            payload,
        }
    }

    /// Create a document.
    pub fn create(collection: impl Into<String>, doc_id: DocumentId, payload: Vec<u8>) -> Self {
        Self::new(OpType::Create, collection, doc_id, payload)
    }

    /// Read a document.
    pub fn read(collection: impl Into<String>, doc_id: DocumentId) -> Self {
        Self::new(OpType::Read, collection, doc_id, Vec::new())
    }

    /// Replace a document.
    pub fn update(collection: impl Into<String>, doc_id: DocumentId, payload: Vec<u8>) -> Self {
        Self::new(OpType::Update, collection, doc_id, payload)
    }

    /// Merge-patch a document.
    pub fn patch(collection: impl Into<String>, doc_id: DocumentId, patch: Vec<u8>) -> Self {
        Self::new(OpType::Patch, collection, doc_id, patch)
    }

    /// Delete a document.
    pub fn delete(collection: impl Into<String>, doc_id: DocumentId) -> Self {
        Self::new(OpType::Delete, collection, doc_id, Vec::new())
    }

    /// Create a collection.
    pub fn create_collection(name: impl Into<String>) -> Self {
        Self::new(OpType::CreateCollection, name, 0, Vec::new())
    }

    /// Drop a collection.
    pub fn drop_collection(name: impl Into<String>) -> Self {
        Self::new(OpType::DeleteCollection, name, 0, Vec::new())
    }

    /// Write a checkpoint.
    pub fn checkpoint() -> Self {
        Self::new(OpType::Checkpoint, String::new(), 0, Vec::new())
    }
}

/// Result of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Operation that ran.
    pub op: OpType,
    /// Document read, or the merged document of a patch.
    pub payload: Option<Vec<u8>>,
    /// Commit ID of a write.
    pub commit: Option<TransactionId>,
}

struct Job {
    request: Request,
    deadline: Instant,
    state: Arc<AtomicU8>,
    reply: Sender<CoreResult<Response>>,
}

impl Job {
    fn run(self, db: &LogicalDatabase) {
        let expired = Instant::now() >= self.deadline;
        if expired || self.state.load(Ordering::Acquire) == CANCELLED {
            tracing::debug!(db = %db.id(), op = %self.request.op, "dropping expired request");
            let _ = self.reply.send(Err(CoreError::Timeout));
            return;
        }

        let state = &self.state;
        let deadline = self.deadline;
        let result = db.execute(&self.request, || {
            Instant::now() < deadline
                && state
                    .compare_exchange(PENDING, COMMITTING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
        });
        // The submitter may have given up; nobody is left to tell.
        let _ = self.reply.send(result);
    }
}

fn worker_loop(db: &LogicalDatabase, queue: &Mutex<Receiver<Job>>) {
    loop {
        let next = queue.lock().recv();
        match next {
            Ok(job) => job.run(db),
            Err(_) => break,
        }
    }
}

/// Bounded request queue and its workers for one logical database.
pub struct Scheduler {
    db_id: DatabaseId,
    sender: Mutex<Option<SyncSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    default_timeout: Duration,
}

impl Scheduler {
    /// Starts the workers for `db` as `config` describes.
    pub fn start(db: Arc<LogicalDatabase>, config: &Config) -> CoreResult<Self> {
        let (sender, receiver) = mpsc::sync_channel(config.queue_depth);
        let receiver = Arc::new(Mutex::new(receiver));
        let count = config.worker_count();

        let mut workers = Vec::with_capacity(count);
        for n in 0..count {
            let db = Arc::clone(&db);
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("strata-db{}-w{n}", db.id().as_u64()))
                .spawn(move || worker_loop(&db, &receiver))?;
            workers.push(handle);
        }
        tracing::debug!(db = %db.id(), workers = count, queue_depth = config.queue_depth, "scheduler started");

        Ok(Self {
            db_id: db.id(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            default_timeout: config.request_timeout,
        })
    }

    /// Submits a request with the configured default deadline.
    pub fn execute(&self, request: Request) -> CoreResult<Response> {
        self.submit(request, self.default_timeout)
    }

    /// Submits a request and waits for its result.
    ///
    /// # Errors
    ///
    /// `Timeout` if the request could not be queued, run and committed
    /// within `timeout`; the request then has no effect. `DatabaseClosed`
    /// after [`Scheduler::shutdown`].
    pub fn submit(&self, request: Request, timeout: Duration) -> CoreResult<Response> {
        let deadline = Instant::now() + timeout;
        let state = Arc::new(AtomicU8::new(PENDING));
        let (reply, result) = mpsc::channel();
        let mut job = Job {
            request,
            deadline,
            state: Arc::clone(&state),
            reply,
        };

        let sender = self.sender.lock().clone().ok_or(CoreError::DatabaseClosed)?;
        loop {
            match sender.try_send(job) {
                Ok(()) => break,
                Err(TrySendError::Full(returned)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::debug!(db = %self.db_id, "request timed out waiting for queue space");
                        return Err(CoreError::Timeout);
                    }
                    job = returned;
                    thread::sleep(ADMISSION_POLL.min(deadline - now));
                }
                Err(TrySendError::Disconnected(_)) => return Err(CoreError::DatabaseClosed),
            }
        }
        drop(sender);

        match result.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(response) => response,
            Err(RecvTimeoutError::Timeout) => {
                if let Ok(response) = result.try_recv() {
                    return response;
                }
                let cancelled = state
                    .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if cancelled {
                    Err(CoreError::Timeout)
                } else {
                    // Already committing: the outcome is decided, wait for it.
                    result.recv().unwrap_or(Err(CoreError::DatabaseClosed))
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(CoreError::DatabaseClosed),
        }
    }

    /// Stops accepting requests, drains the queue and joins the workers.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!(db = %self.db_id, "scheduler worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("db_id", &self.db_id)
            .field("workers", &self.workers.lock().len())
            .finish_non_exhaustive()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriterMode;
    use crate::memory::{BufferPool, MemoryGovernor};
    use std::path::Path;
    use tempfile::tempdir;

    fn start(dir: &Path, config: Config) -> (Arc<LogicalDatabase>, Scheduler) {
        let config = Config {
            data_dir: dir.to_path_buf(),
            ..config
        }
        .sync_on_commit(false);
        let governor = Arc::new(MemoryGovernor::new(config.global_memory_bytes));
        let db = Arc::new(
            LogicalDatabase::open(DatabaseId::new(1), "sched", &config, governor, Arc::new(BufferPool::new()))
                .unwrap(),
        );
        let scheduler = Scheduler::start(Arc::clone(&db), &config).unwrap();
        (db, scheduler)
    }

    #[test]
    fn requests_run_in_order() {
        let dir = tempdir().unwrap();
        let (_db, scheduler) = start(dir.path(), Config::default());

        scheduler
            .execute(Request::create("_default", 1, b"Hello, World!".to_vec()))
            .unwrap();
        let read = scheduler.execute(Request::read("_default", 1)).unwrap();
        assert_eq!(read.payload.unwrap(), b"Hello, World!");

        scheduler.execute(Request::delete("_default", 1)).unwrap();
        assert!(matches!(
            scheduler.execute(Request::read("_default", 1)).unwrap_err(),
            CoreError::NotFound { .. }
        ));
    }

    #[test]
    fn expired_request_has_no_effect() {
        let dir = tempdir().unwrap();
        let (db, scheduler) = start(dir.path(), Config::default());

        let err = scheduler
            .submit(Request::create("_default", 1, b"late".to_vec()), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout));

        // The worker answers the expired job without running it.
        scheduler.execute(Request::create("_default", 2, b"ok".to_vec())).unwrap();
        assert!(db.read("_default", 1).is_err());
        assert_eq!(db.stats().op(OpType::Create).ok, 1);
    }

    #[test]
    fn full_queue_applies_backpressure_without_losing_requests() {
        let dir = tempdir().unwrap();
        let (db, scheduler) = start(dir.path(), Config::default().queue_depth(2));
        let scheduler = Arc::new(scheduler);

        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let scheduler = Arc::clone(&scheduler);
                thread::spawn(move || {
                    for i in 0..25u64 {
                        let id = t * 100 + i;
                        scheduler
                            .execute(Request::create("_default", id, id.to_le_bytes().to_vec()))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(db.document_count("_default").unwrap(), 200);
    }

    #[test]
    fn multi_worker_conflicts_are_detected() {
        let dir = tempdir().unwrap();
        let (db, scheduler) = start(
            dir.path(),
            Config::default().writer_mode(WriterMode::MultiWorker, 4),
        );
        let scheduler = Arc::new(scheduler);
        scheduler.execute(Request::create("_default", 1, b"0".to_vec())).unwrap();

        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let scheduler = Arc::clone(&scheduler);
                thread::spawn(move || {
                    let mut committed = 0;
                    for _ in 0..25 {
                        match scheduler.execute(Request::update("_default", 1, vec![b'a' + t])) {
                            Ok(_) => committed += 1,
                            Err(CoreError::Conflict { doc_id: 1, .. }) => {}
                            Err(other) => panic!("unexpected error: {other}"),
                        }
                    }
                    committed
                })
            })
            .collect();
        let committed: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        let stats = db.stats();
        assert_eq!(stats.op(OpType::Update).ok, 100);
        assert_eq!(committed + stats.conflicts, 100);
        let value = db.read("_default", 1).unwrap();
        assert!((b'a'..b'e').contains(&value[0]));
    }

    #[test]
    fn shutdown_rejects_new_requests() {
        let dir = tempdir().unwrap();
        let (_db, scheduler) = start(dir.path(), Config::default());
        scheduler.execute(Request::create("_default", 1, vec![1])).unwrap();
        scheduler.shutdown();
        scheduler.shutdown();
        assert!(matches!(
            scheduler.execute(Request::read("_default", 1)).unwrap_err(),
            CoreError::DatabaseClosed
        ));
    }
}
