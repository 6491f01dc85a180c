//! The engine: catalog, open databases and background maintenance.

use crate::catalog::{Catalog, CatalogEntry, DatabaseStatus};
use crate::config::Config;
use crate::database::LogicalDatabase;
use crate::dir::DataDir;
use crate::error::{CoreError, CoreResult, Missing};
use crate::memory::{BufferPool, GovernorStats, MemoryGovernor};
use crate::query::{self, Query, QueryStream};
use crate::scheduler::{Request, Response, Scheduler};
use crate::types::{DatabaseId, Lsn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Names a logical database by ID or by catalog name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// By ID.
    Id(DatabaseId),
    /// By active name.
    Name(String),
}

impl From<DatabaseId> for Target {
    fn from(id: DatabaseId) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

/// Background work the maintenance loop performs on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceEvent {
    /// Close databases idle for longer than `idle_timeout`.
    Evict,
    /// Compact databases whose tombstone ratio crossed the threshold.
    Compact,
    /// Checkpoint databases not checkpointed within `checkpoint_interval`.
    Checkpoint,
}

impl MaintenanceEvent {
    const ALL: [Self; 3] = [Self::Evict, Self::Compact, Self::Checkpoint];
}

#[derive(Debug)]
struct OpenDatabase {
    db: Arc<LogicalDatabase>,
    scheduler: Scheduler,
    workers: usize,
    last_access: Mutex<Instant>,
    last_checkpoint: Mutex<Instant>,
}

impl OpenDatabase {
    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    /// Whether anything outside the registry and the scheduler still uses
    /// the database.
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.db) > 1 + self.workers || self.db.held_snapshots() > 0
    }

    fn close(&self) -> CoreResult<()> {
        self.scheduler.shutdown();
        self.db.close()
    }
}

struct Shared {
    config: Config,
    dir: DataDir,
    catalog: Catalog,
    governor: Arc<MemoryGovernor>,
    buffers: Arc<BufferPool>,
    open: RwLock<HashMap<DatabaseId, Arc<OpenDatabase>>>,
    /// Per-database locks serializing open, close and eviction of one ID
    /// without holding `open` across recovery.
    slots: Mutex<HashMap<DatabaseId, Arc<Mutex<()>>>>,
    closed: AtomicBool,
}

impl Shared {
    fn ensure_running(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CoreError::DatabaseClosed)
        } else {
            Ok(())
        }
    }

    fn resolve(&self, target: &Target) -> CoreResult<DatabaseId> {
        match target {
            Target::Id(id) => {
                let entry = self.catalog.get(*id)?;
                if entry.status == DatabaseStatus::Active {
                    Ok(*id)
                } else {
                    Err(CoreError::not_found(Missing::Database, id))
                }
            }
            Target::Name(name) => self.catalog.get_by_name(name),
        }
    }

    fn slot(&self, id: DatabaseId) -> Arc<Mutex<()>> {
        Arc::clone(self.slots.lock().entry(id).or_default())
    }

    fn cached(&self, id: DatabaseId) -> Option<Arc<OpenDatabase>> {
        let open = self.open.read();
        let handle = open.get(&id).filter(|h| h.db.is_open())?;
        handle.touch();
        Some(Arc::clone(handle))
    }

    /// The open handle of `id`, opening (and recovering) it on first use.
    ///
    /// Recovery runs under the database's own slot, so other databases stay
    /// reachable while one is opening.
    fn handle(&self, id: DatabaseId) -> CoreResult<Arc<OpenDatabase>> {
        self.ensure_running()?;
        if let Some(handle) = self.cached(id) {
            return Ok(handle);
        }

        let slot = self.slot(id);
        let _opening = slot.lock();
        if let Some(handle) = self.cached(id) {
            return Ok(handle);
        }
        let entry = self.catalog.get(id)?;
        if entry.status != DatabaseStatus::Active {
            return Err(CoreError::not_found(Missing::Database, id));
        }
        if let Some(stale) = self.open.write().remove(&id) {
            tracing::warn!(db = %id, "replacing a database handle that closed itself");
            stale.scheduler.shutdown();
        }

        let db = Arc::new(LogicalDatabase::open(
            id,
            &entry.name,
            &self.config,
            Arc::clone(&self.governor),
            Arc::clone(&self.buffers),
        )?);
        let scheduler = Scheduler::start(Arc::clone(&db), &self.config)?;
        let now = Instant::now();
        let handle = Arc::new(OpenDatabase {
            db,
            scheduler,
            workers: self.config.worker_count(),
            last_access: Mutex::new(now),
            last_checkpoint: Mutex::new(now),
        });

        let mut open = self.open.write();
        if self.closed.load(Ordering::Acquire) {
            drop(open);
            if let Err(err) = handle.close() {
                tracing::warn!(db = %id, error = %err, "error closing database opened during shutdown");
            }
            return Err(CoreError::DatabaseClosed);
        }
        open.insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    fn handles(&self) -> Vec<Arc<OpenDatabase>> {
        self.open.read().values().cloned().collect()
    }

    fn run_maintenance(&self, event: MaintenanceEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match event {
            MaintenanceEvent::Evict => self.evict_idle(),
            MaintenanceEvent::Compact => {
                for handle in self.handles() {
                    if handle.db.is_open() && handle.db.needs_compaction() {
                        if let Err(err) = handle.db.compact() {
                            tracing::warn!(db = %handle.db.id(), error = %err, "compaction failed");
                        }
                    }
                }
            }
            MaintenanceEvent::Checkpoint => {
                let interval = self.config.checkpoint_interval;
                if interval.is_zero() {
                    return;
                }
                for handle in self.handles() {
                    let due = handle.last_checkpoint.lock().elapsed() >= interval;
                    if due && handle.db.is_open() {
                        match handle.db.checkpoint() {
                            Ok(_) => *handle.last_checkpoint.lock() = Instant::now(),
                            Err(err) => {
                                tracing::warn!(db = %handle.db.id(), error = %err, "checkpoint failed");
                            }
                        }
                    }
                }
            }
        }
    }

    fn evict_idle(&self) {
        let timeout = self.config.idle_timeout;
        if timeout.is_zero() {
            return;
        }
        let candidates: Vec<DatabaseId> = self
            .open
            .read()
            .iter()
            .filter(|(_, h)| h.idle_for() >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in candidates {
            let slot = self.slot(id);
            let _evicting = slot.lock();
            let evicted = {
                let mut open = self.open.write();
                let idle = open
                    .get(&id)
                    .is_some_and(|h| Arc::strong_count(h) == 1 && !h.in_use() && h.idle_for() >= timeout);
                if idle {
                    open.remove(&id)
                } else {
                    None
                }
            };
            if let Some(handle) = evicted {
                match handle.close() {
                    Ok(()) => tracing::info!(db = %id, "evicted idle database"),
                    Err(err) => tracing::warn!(db = %id, error = %err, "error closing idle database"),
                }
            }
        }
    }
}

/// Ticker and worker threads driving [`MaintenanceEvent`]s.
struct Maintenance {
    stop: Option<Sender<()>>,
    ticker: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Maintenance {
    fn start(shared: Arc<Shared>) -> CoreResult<Self> {
        let interval = shared.config.maintenance_interval;
        let (stop, stopped) = mpsc::channel::<()>();
        let (events, received) = mpsc::channel::<MaintenanceEvent>();

        let ticker = thread::Builder::new()
            .name("strata-maintenance-tick".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                for event in MaintenanceEvent::ALL {
                    if events.send(event).is_err() {
                        return;
                    }
                }
            })?;

        let worker = thread::Builder::new()
            .name("strata-maintenance".into())
            .spawn(move || {
                for event in received {
                    shared.run_maintenance(event);
                }
                tracing::debug!("maintenance stopped");
            })?;

        Ok(Self {
            stop: Some(stop),
            ticker: Some(ticker),
            worker: Some(worker),
        })
    }

    fn stop(&mut self) {
        self.stop.take();
        for handle in [self.ticker.take(), self.worker.take()].into_iter().flatten() {
            if handle.join().is_err() {
                tracing::error!("maintenance thread panicked");
            }
        }
    }
}

/// An embedded Strata engine rooted at one data directory.
///
/// The engine owns the catalog, the memory governor and the buffer pool,
/// and opens logical databases lazily on first access.
///
/// ```rust,ignore
/// let engine = Engine::open(Config::new("./data"))?;
/// let id = engine.create_database("app")?;
/// engine.execute("app", Request::create("_default", 1, b"Hello".to_vec()))?;
/// let rows: Vec<Row> = engine
///     .query(id, "_default", &Query::default())?
///     .collect::<CoreResult<_>>()?;
/// engine.shutdown()?;
/// ```
pub struct Engine {
    shared: Arc<Shared>,
    maintenance: Mutex<Option<Maintenance>>,
}

impl Engine {
    /// Opens the engine, creating the data directory if needed.
    ///
    /// # Errors
    ///
    /// `DatabaseLocked` if another engine holds the directory,
    /// `InvalidArgument` for an invalid configuration, `Corruption` for a
    /// damaged catalog.
    pub fn open(config: Config) -> CoreResult<Self> {
        config.validate()?;
        let dir = DataDir::open(&config.data_dir, true)?;
        let catalog = Catalog::open(&dir.catalog_path())?;
        let governor = Arc::new(MemoryGovernor::new(config.global_memory_bytes));

        tracing::info!(
            path = %dir.path().display(),
            databases = catalog.list().len(),
            memory = config.global_memory_bytes,
            "engine opened"
        );

        let shared = Arc::new(Shared {
            config,
            dir,
            catalog,
            governor,
            buffers: Arc::new(BufferPool::new()),
            open: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let maintenance = if shared.config.maintenance_interval.is_zero() {
            None
        } else {
            Some(Maintenance::start(Arc::clone(&shared))?)
        };
        Ok(Self {
            shared,
            maintenance: Mutex::new(maintenance),
        })
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Registers a new logical database. It is opened on first access.
    pub fn create_database(&self, name: &str) -> CoreResult<DatabaseId> {
        self.shared.ensure_running()?;
        self.shared.catalog.create(name)
    }

    /// Deletes a database: marks it deleted, closes it and removes its files.
    pub fn drop_database(&self, target: impl Into<Target>) -> CoreResult<()> {
        self.shared.ensure_running()?;
        let id = self.shared.resolve(&target.into())?;
        self.shared.catalog.delete(id)?;
        let slot = self.shared.slot(id);
        let _dropping = slot.lock();
        let handle = self.shared.open.write().remove(&id);
        if let Some(handle) = handle {
            if let Err(err) = handle.close() {
                tracing::warn!(db = %id, error = %err, "error closing dropped database");
            }
        }
        self.shared.dir.remove_database_files(id)
    }

    /// Active databases, ordered by ID.
    #[must_use]
    pub fn list_databases(&self) -> Vec<CatalogEntry> {
        self.shared.catalog.list()
    }

    /// The open database, opening and recovering it if necessary.
    pub fn database(&self, target: impl Into<Target>) -> CoreResult<Arc<LogicalDatabase>> {
        let id = self.shared.resolve(&target.into())?;
        Ok(Arc::clone(&self.shared.handle(id)?.db))
    }

    /// IDs of the databases currently open.
    #[must_use]
    pub fn open_databases(&self) -> Vec<DatabaseId> {
        let mut ids: Vec<_> = self.shared.open.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Runs a request through the database's scheduler with the default
    /// deadline.
    pub fn execute(&self, target: impl Into<Target>, request: Request) -> CoreResult<Response> {
        self.submit(target, request, self.shared.config.request_timeout)
    }

    /// Runs a request with an explicit deadline.
    pub fn submit(
        &self,
        target: impl Into<Target>,
        request: Request,
        timeout: Duration,
    ) -> CoreResult<Response> {
        let id = self.shared.resolve(&target.into())?;
        self.shared.handle(id)?.scheduler.submit(request, timeout)
    }

    /// Streams the documents of `collection` matching `query`.
    pub fn query(
        &self,
        target: impl Into<Target>,
        collection: &str,
        query: &Query,
    ) -> CoreResult<QueryStream> {
        let id = self.shared.resolve(&target.into())?;
        let handle = self.shared.handle(id)?;
        query::execute(
            Arc::clone(&handle.db),
            collection,
            query,
            self.shared.config.query_partitions,
        )
    }

    /// Checkpoints a database now.
    pub fn checkpoint(&self, target: impl Into<Target>) -> CoreResult<Lsn> {
        let id = self.shared.resolve(&target.into())?;
        let handle = self.shared.handle(id)?;
        let cut = handle.db.checkpoint()?;
        *handle.last_checkpoint.lock() = Instant::now();
        Ok(cut)
    }

    /// Closes a database if it is open. The next access reopens it.
    pub fn close_database(&self, target: impl Into<Target>) -> CoreResult<()> {
        let id = self.shared.resolve(&target.into())?;
        let slot = self.shared.slot(id);
        let _closing = slot.lock();
        let handle = self.shared.open.write().remove(&id);
        match handle {
            Some(handle) => handle.close(),
            None => Ok(()),
        }
    }

    /// Runs one maintenance pass immediately.
    pub fn run_maintenance(&self, event: MaintenanceEvent) {
        self.shared.run_maintenance(event);
    }

    /// Global memory counters.
    #[must_use]
    pub fn memory_stats(&self) -> GovernorStats {
        self.shared.governor.stats()
    }

    /// Stops maintenance and closes every open database. Idempotent.
    pub fn shutdown(&self) -> CoreResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut maintenance) = self.maintenance.lock().take() {
            maintenance.stop();
        }

        let handles: Vec<_> = self.shared.open.write().drain().collect();
        let mut first_error = None;
        for (id, handle) in handles {
            if let Err(err) = handle.close() {
                tracing::error!(db = %id, error = %err, "error closing database");
                first_error.get_or_insert(err);
            }
        }
        tracing::info!(path = %self.shared.dir.path().display(), "engine shut down");
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("path", &self.shared.dir.path())
            .field("open", &self.open_databases())
            .finish_non_exhaustive()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> Config {
        Config::new(dir)
            .sync_on_commit(false)
            .maintenance_interval(Duration::ZERO)
    }

    #[test]
    fn create_open_and_drop() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();

        let id = engine.create_database("app").unwrap();
        assert!(matches!(
            engine.create_database("app").unwrap_err(),
            CoreError::AlreadyExists { .. }
        ));
        assert!(engine.open_databases().is_empty());

        engine
            .execute("app", Request::create("_default", 1, b"x".to_vec()))
            .unwrap();
        assert_eq!(engine.open_databases(), [id]);

        engine.drop_database(id).unwrap();
        assert!(engine.open_databases().is_empty());
        assert!(!dir.path().join(format!("db-{:016x}", id.as_u64())).exists());
        assert!(matches!(
            engine.execute("app", Request::read("_default", 1)).unwrap_err(),
            CoreError::NotFound { kind: Missing::Database, .. }
        ));

        // The name is free again and gets a fresh ID.
        let again = engine.create_database("app").unwrap();
        assert!(again > id);
    }

    #[test]
    fn second_engine_on_same_directory_is_locked_out() {
        let dir = tempdir().unwrap();
        let _engine = Engine::open(config(dir.path())).unwrap();
        assert!(matches!(
            Engine::open(config(dir.path())).unwrap_err(),
            CoreError::DatabaseLocked
        ));
    }

    #[test]
    fn databases_survive_engine_restart() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(config(dir.path())).unwrap();
            engine.create_database("a").unwrap();
            let b = engine.create_database("b").unwrap();
            engine
                .execute(b, Request::create("_default", 9, b"kept".to_vec()))
                .unwrap();
            engine.shutdown().unwrap();
        }
        let engine = Engine::open(config(dir.path())).unwrap();
        let names: Vec<_> = engine.list_databases().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["a", "b"]);
        let read = engine.execute("b", Request::read("_default", 9)).unwrap();
        assert_eq!(read.payload.unwrap(), b"kept");
    }

    #[test]
    fn idle_databases_are_evicted_and_reopened() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path()).idle_timeout(Duration::from_millis(1))).unwrap();
        let id = engine.create_database("idle").unwrap();
        engine
            .execute(id, Request::create("_default", 1, vec![5; 32]))
            .unwrap();
        let used_before = engine.memory_stats().used;
        assert!(used_before >= 32);

        thread::sleep(Duration::from_millis(5));
        engine.run_maintenance(MaintenanceEvent::Evict);
        assert!(engine.open_databases().is_empty());
        assert_eq!(engine.memory_stats().used, 0);

        let read = engine.execute(id, Request::read("_default", 1)).unwrap();
        assert_eq!(read.payload.unwrap(), vec![5; 32]);
        assert_eq!(engine.open_databases(), [id]);
    }

    #[test]
    fn databases_in_use_are_not_evicted() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path()).idle_timeout(Duration::from_millis(1))).unwrap();
        let id = engine.create_database("busy").unwrap();
        let db = engine.database(id).unwrap();
        let snapshot = db.snapshot().unwrap();
        drop(db);

        thread::sleep(Duration::from_millis(5));
        engine.run_maintenance(MaintenanceEvent::Evict);
        assert_eq!(engine.open_databases(), [id]);

        drop(snapshot);
        engine.run_maintenance(MaintenanceEvent::Evict);
        assert!(engine.open_databases().is_empty());
    }

    #[test]
    fn maintenance_compacts_and_checkpoints() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path())
            .checkpoint_interval(Duration::from_millis(1))
            .compaction_threshold(0.5);
        let engine = Engine::open(cfg).unwrap();
        let id = engine.create_database("m").unwrap();
        for doc in 0..4 {
            engine
                .execute(id, Request::create("_default", doc, vec![1; 8]))
                .unwrap();
            engine.execute(id, Request::delete("_default", doc)).unwrap();
        }

        engine.run_maintenance(MaintenanceEvent::Compact);
        let db = engine.database(id).unwrap();
        assert_eq!(db.version_counts(), (0, 0));

        thread::sleep(Duration::from_millis(5));
        engine.run_maintenance(MaintenanceEvent::Checkpoint);
        assert_eq!(db.stats().checkpoints, 1);
    }

    #[test]
    fn shutdown_is_final() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        engine.create_database("x").unwrap();
        engine.shutdown().unwrap();
        engine.shutdown().unwrap();
        assert!(matches!(
            engine.create_database("y").unwrap_err(),
            CoreError::DatabaseClosed
        ));
    }

    #[test]
    fn opening_one_database_does_not_block_another() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(Engine::open(config(dir.path())).unwrap());
        let slow = engine.create_database("slow").unwrap();
        let fast = engine.create_database("fast").unwrap();

        // Stand in for a long recovery of `slow`.
        let slot = engine.shared.slot(slow);
        let recovering = slot.lock();

        let (done, finished) = mpsc::channel();
        let opener = Arc::clone(&engine);
        let worker = thread::spawn(move || {
            let db = opener.database(fast).map(|db| db.id());
            done.send(db).unwrap();
        });
        let opened = finished.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(opened.unwrap(), fast);
        assert_eq!(engine.open_databases(), [fast]);

        drop(recovering);
        worker.join().unwrap();
        engine.database(slow).unwrap();
        assert_eq!(engine.open_databases(), [slow, fast]);
    }

    #[test]
    fn concurrent_first_access_opens_once() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(Engine::open(config(dir.path())).unwrap());
        let id = engine.create_database("shared").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || engine.database(id).unwrap())
            })
            .collect();
        let dbs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(dbs.iter().all(|db| Arc::ptr_eq(db, &dbs[0])));
    }

    #[test]
    fn deleted_entries_are_never_reopened() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        let id = engine.create_database("gone").unwrap();
        engine.drop_database(id).unwrap();

        assert!(matches!(
            engine.shared.handle(id).unwrap_err(),
            CoreError::NotFound { kind: Missing::Database, .. }
        ));
        assert!(engine.open_databases().is_empty());
        assert!(!dir.path().join(format!("db-{:016x}", id.as_u64())).exists());
    }
}
