//! # Strata Core
//!
//! Embedded, crash-safe document database engine.
//!
//! This crate provides:
//! - A durable catalog of independently managed logical databases
//! - A segmented, checksummed write-ahead log per database, with checkpoints
//! - Snapshot-isolated MVCC transactions with first-committer-wins conflicts
//! - A memory governor bounding usage globally and per database, with a
//!   separate replay budget for recovery
//! - A per-database request scheduler with bounded queues and deadlines
//! - A streaming query engine with partition fan-out and k-way merge
//!
//! ## Example
//!
//! ```rust,no_run
//! use strata_core::{Config, Engine, Query, Request};
//!
//! let engine = Engine::open(Config::new("./data"))?;
//! let db = engine.create_database("app")?;
//! engine.execute(db, Request::create("_default", 1, br#"{"n": 1}"#.to_vec()))?;
//! for row in engine.query(db, "_default", &Query::new())? {
//!     let row = row?;
//!     println!("{}", row.doc_id);
//! }
//! engine.shutdown()?;
//! # Ok::<(), strata_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;
pub mod checkpoint;
mod config;
mod database;
pub mod dir;
mod engine;
mod error;
pub mod memory;
pub mod mvcc;
pub mod query;
mod scheduler;
mod stats;
mod types;
pub mod wal;

pub use catalog::{Catalog, CatalogEntry, DatabaseStatus};
pub use config::{Config, WriterMode};
pub use database::{apply_merge_patch, LogicalDatabase};
pub use engine::{Engine, MaintenanceEvent, Target};
pub use error::{CoreError, CoreResult, ErrorCategory, Missing};
pub use memory::{BufferPool, GovernorStats, MemoryGovernor};
pub use mvcc::{CollectionMetadata, CompactionReport, Snapshot, Transaction, TransactionState};
pub use query::{Direction, Expression, OrderSpec, Query, QueryStream, Row, RowStream};
pub use scheduler::{Request, Response, Scheduler};
pub use stats::{OpCount, StatsSnapshot};
pub use types::{DatabaseId, Document, DocumentId, Lsn, TransactionId, DEFAULT_COLLECTION};
pub use wal::OpType;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
