//! Engine configuration.

use crate::error::{CoreError, CoreResult};
use std::path::PathBuf;
use std::time::Duration;

/// How a logical database schedules its mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterMode {
    /// One worker applies every mutation in arrival order, so LSN order is
    /// the serialization order.
    SingleWriter,
    /// Several workers drain the queue concurrently. Operations on different
    /// documents may commit in any order; operations on the same document
    /// are ordered by the commit-time conflict check.
    MultiWorker,
}

/// Configuration for an [`crate::Engine`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for the catalog and every database's files.
    pub data_dir: PathBuf,

    /// Size at which the active WAL segment is rotated.
    pub wal_segment_size: u64,

    /// Whether commits sync the WAL before they are acknowledged.
    pub sync_on_commit: bool,

    /// How often to checkpoint automatically (zero = never).
    pub checkpoint_interval: Duration,

    /// Whether a checkpoint is written when a database is closed.
    pub checkpoint_auto_create: bool,

    /// Number of checkpoint files kept per database.
    pub checkpoint_retention: usize,

    /// Global memory capacity shared by every database.
    pub global_memory_bytes: u64,

    /// Default per-database limit (zero = bounded only by the global capacity).
    pub per_db_memory_bytes: u64,

    /// Override for the WAL replay budget.
    pub replay_budget_bytes: Option<u64>,

    /// Maximum queued requests per database before submitters block.
    pub queue_depth: usize,

    /// Writer mode for new database handles.
    pub writer_mode: WriterMode,

    /// Worker count in [`WriterMode::MultiWorker`].
    pub workers: usize,

    /// Default deadline for a submitted request.
    pub request_timeout: Duration,

    /// Close databases not accessed for this long (zero = never).
    pub idle_timeout: Duration,

    /// Tick of the maintenance loop.
    pub maintenance_interval: Duration,

    /// Tombstone-to-live ratio that triggers compaction.
    pub compaction_threshold: f64,

    /// Number of partitions a query fans out over.
    pub query_partitions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./strata-data"),
            wal_segment_size: 64 * 1024 * 1024, // 64 MiB
            sync_on_commit: true,
            checkpoint_interval: Duration::ZERO,
            checkpoint_auto_create: false,
            checkpoint_retention: 2,
            global_memory_bytes: 1024 * 1024 * 1024, // 1 GiB
            per_db_memory_bytes: 256 * 1024 * 1024,  // 256 MiB
            replay_budget_bytes: None,
            queue_depth: 1024,
            writer_mode: WriterMode::SingleWriter,
            workers: 4,
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::ZERO,
            maintenance_interval: Duration::from_secs(1),
            compaction_threshold: 0.5,
            query_partitions: 4,
        }
    }
}

impl Config {
    /// Default configuration rooted at `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Sets the WAL segment size.
    #[must_use]
    pub fn wal_segment_size(mut self, size: u64) -> Self {
        self.wal_segment_size = size;
        self
    }

    /// Sets whether commits sync the WAL.
    #[must_use]
    pub fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the automatic checkpoint interval.
    #[must_use]
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Sets whether closing a database writes a checkpoint.
    #[must_use]
    pub fn checkpoint_auto_create(mut self, value: bool) -> Self {
        self.checkpoint_auto_create = value;
        self
    }

    /// Sets how many checkpoint files are kept.
    #[must_use]
    pub fn checkpoint_retention(mut self, count: usize) -> Self {
        self.checkpoint_retention = count;
        self
    }

    /// Sets global and per-database memory caps in bytes.
    #[must_use]
    pub fn memory(mut self, global_bytes: u64, per_db_bytes: u64) -> Self {
        self.global_memory_bytes = global_bytes;
        self.per_db_memory_bytes = per_db_bytes;
        self
    }

    /// Overrides the WAL replay budget.
    #[must_use]
    pub fn replay_budget(mut self, bytes: u64) -> Self {
        self.replay_budget_bytes = Some(bytes);
        self
    }

    /// Sets the queue depth.
    #[must_use]
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Sets the writer mode and worker count.
    #[must_use]
    pub fn writer_mode(mut self, mode: WriterMode, workers: usize) -> Self {
        self.writer_mode = mode;
        self.workers = workers;
        self
    }

    /// Sets the default request deadline.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the idle eviction timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the maintenance tick.
    #[must_use]
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Sets the compaction trigger ratio.
    #[must_use]
    pub fn compaction_threshold(mut self, ratio: f64) -> Self {
        self.compaction_threshold = ratio;
        self
    }

    /// Sets the query fan-out.
    #[must_use]
    pub fn query_partitions(mut self, partitions: usize) -> Self {
        self.query_partitions = partitions;
        self
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.wal_segment_size == 0 {
            return Err(CoreError::invalid_argument("wal_segment_size must be > 0"));
        }
        if self.queue_depth == 0 {
            return Err(CoreError::invalid_argument("queue_depth must be > 0"));
        }
        if self.writer_mode == WriterMode::MultiWorker && self.workers == 0 {
            return Err(CoreError::invalid_argument(
                "multi-worker mode needs at least one worker",
            ));
        }
        if self.query_partitions == 0 {
            return Err(CoreError::invalid_argument("query_partitions must be > 0"));
        }
        if self.global_memory_bytes == 0 {
            return Err(CoreError::invalid_argument(
                "global_memory_bytes must be > 0",
            ));
        }
        if self.compaction_threshold.is_nan() || self.compaction_threshold <= 0.0 {
            return Err(CoreError::invalid_argument(
                "compaction_threshold must be positive",
            ));
        }
        Ok(())
    }

    /// Number of workers a database's scheduler runs.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        match self.writer_mode {
            WriterMode::SingleWriter => 1,
            WriterMode::MultiWorker => self.workers,
        }
    }
}
