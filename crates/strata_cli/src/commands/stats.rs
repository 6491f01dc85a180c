//! Per-database statistics.

use super::{ensure_data_dir, CliError, Format};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use strata_core::memory::DbMemoryUsage;
use strata_core::{Config, Engine, StatsSnapshot};

/// Document count of one collection.
#[derive(Debug, Serialize)]
pub struct CollectionStats {
    /// Collection name.
    pub name: String,
    /// Visible documents.
    pub documents: usize,
}

/// Statistics gathered by opening one database.
#[derive(Debug, Serialize)]
pub struct DatabaseStats {
    /// Database ID.
    pub db_id: u64,
    /// Database name.
    pub name: String,
    /// Collections and their document counts.
    pub collections: Vec<CollectionStats>,
    /// Live and superseded versions held in memory.
    pub versions: (usize, usize),
    /// Memory charged to the database after recovery.
    pub memory: Option<DbMemoryUsage>,
    /// WAL segment count.
    pub wal_segments: usize,
    /// WAL bytes on disk.
    pub wal_bytes: u64,
    /// Counters since open, including replayed records.
    pub counters: StatsSnapshot,
}

/// Opens database `name` (replaying its WAL) and gathers its statistics.
pub fn gather(path: &Path, name: &str) -> Result<DatabaseStats, CliError> {
    ensure_data_dir(path)?;
    let config = Config::new(path)
        .maintenance_interval(Duration::ZERO)
        .checkpoint_auto_create(false);
    let engine = Engine::open(config)?;
    let db = engine.database(name)?;

    let collections = db
        .collections()?
        .into_iter()
        .map(|c| CollectionStats {
            name: c.name,
            documents: c.doc_count,
        })
        .collect();
    let segments = db.wal_segments()?;
    let stats = DatabaseStats {
        db_id: db.id().as_u64(),
        name: db.name().to_string(),
        collections,
        versions: db.version_counts(),
        memory: db.memory_usage(),
        wal_segments: segments.len(),
        wal_bytes: segments.iter().map(|s| s.size).sum(),
        counters: db.stats(),
    };
    drop(db);
    engine.shutdown()?;
    Ok(stats)
}

/// Runs the stats command.
pub fn run(path: &Path, name: &str, format: Format) -> Result<(), CliError> {
    let stats = gather(path, name)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        Format::Text => {
            println!("Database {} (id {})", stats.name, stats.db_id);
            println!("================");
            println!("Collections:");
            for collection in &stats.collections {
                println!("  {:<24} {} documents", collection.name, collection.documents);
            }
            println!("Versions:      {} live, {} superseded", stats.versions.0, stats.versions.1);
            if let Some(memory) = &stats.memory {
                println!("Memory:        {} / {} bytes", memory.used, memory.limit);
            }
            println!("WAL:           {} segments, {} bytes", stats.wal_segments, stats.wal_bytes);
            println!("Replayed:      {} records", stats.counters.replayed_records);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::Request;
    use tempfile::tempdir;

    #[test]
    fn counts_documents_after_replay() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(Config::new(dir.path())).unwrap();
            let id = engine.create_database("app").unwrap();
            engine
                .execute(id, Request::create_collection("users"))
                .unwrap();
            for doc in 0..4 {
                engine
                    .execute(id, Request::create("users", doc, b"{}".to_vec()))
                    .unwrap();
            }
            engine.execute(id, Request::delete("users", 0)).unwrap();
        }

        let stats = gather(dir.path(), "app").unwrap();
        let users = stats.collections.iter().find(|c| c.name == "users").unwrap();
        assert_eq!(users.documents, 3);
        assert!(stats.counters.replayed_records > 0);
        assert!(stats.wal_segments >= 1);
    }
}
