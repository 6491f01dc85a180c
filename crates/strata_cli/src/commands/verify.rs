//! Data directory verification.

use super::{ensure_data_dir, CliError};
use std::path::Path;
use strata_core::checkpoint::{list_checkpoints, read_checkpoint};
use strata_core::dir::{catalog_path, database_path, wal_path};
use strata_core::wal::Wal;
use strata_core::{Catalog, CatalogEntry};

/// Findings for one database.
#[derive(Debug)]
pub struct DatabaseReport {
    /// Catalog entry.
    pub entry: CatalogEntry,
    /// Records replayable from the WAL.
    pub records: usize,
    /// Whether a torn final record was found (tolerated).
    pub torn_tail: bool,
    /// Checkpoint files that read back cleanly.
    pub checkpoints: usize,
    /// Problems that would fail recovery or lose a checkpoint.
    pub errors: Vec<String>,
}

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// One report per active database.
    pub databases: Vec<DatabaseReport>,
}

impl VerifyResult {
    /// Total problems found.
    #[must_use]
    pub fn problems(&self) -> usize {
        self.databases.iter().map(|db| db.errors.len()).sum()
    }
}

/// Replays every active database's WAL and reads back its checkpoints.
pub fn verify(path: &Path) -> Result<VerifyResult, CliError> {
    ensure_data_dir(path)?;
    let catalog = Catalog::open(&catalog_path(path))?;
    let mut result = VerifyResult::default();

    for entry in catalog.list() {
        let id = entry.db_id;
        let mut report = DatabaseReport {
            entry,
            records: 0,
            torn_tail: false,
            checkpoints: 0,
            errors: Vec::new(),
        };

        match Wal::read_dir(&wal_path(path, id), id) {
            Ok(replay) => {
                report.records = replay.records.len();
                report.torn_tail = replay.torn_tail;
            }
            Err(err) => report.errors.push(format!("WAL: {err}")),
        }

        match list_checkpoints(&database_path(path, id)) {
            Ok(files) => {
                for (_, file) in files {
                    match read_checkpoint(&file, id) {
                        Ok(_) => report.checkpoints += 1,
                        Err(err) => report.errors.push(format!("{}: {err}", file.display())),
                    }
                }
            }
            Err(err) => report.errors.push(format!("checkpoints: {err}")),
        }

        result.databases.push(report);
    }
    Ok(result)
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), CliError> {
    println!("Verifying data directory at {}", path.display());
    println!();

    let result = verify(path)?;
    for db in &result.databases {
        let state = if db.errors.is_empty() { "ok" } else { "FAILED" };
        print!(
            "{:>6} {:<24} {state}: {} records, {} checkpoints",
            db.entry.db_id.as_u64(),
            db.entry.name,
            db.records,
            db.checkpoints
        );
        if db.torn_tail {
            print!(", torn tail");
        }
        println!();
        for error in &db.errors {
            println!("         {error}");
        }
    }

    println!();
    match result.problems() {
        0 => {
            println!("✓ Verification passed");
            Ok(())
        }
        n => {
            println!("✗ Verification failed");
            Err(CliError::Verification(n))
        }
    }
}
