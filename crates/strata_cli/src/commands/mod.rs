//! CLI command implementations.

pub mod catalog;
pub mod dump_wal;
pub mod stats;
pub mod verify;

use strata_core::CoreError;
use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The engine or an on-disk structure failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Output could not be encoded.
    #[error("cannot encode output: {0}")]
    Json(#[from] serde_json::Error),

    /// `verify` found problems.
    #[error("verification failed: {0} problem(s) found")]
    Verification(usize),

    /// No catalog at the given path.
    #[error("no Strata data directory at {0}")]
    NotADataDir(String),
}

/// Output format shared by the commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

pub(crate) fn ensure_data_dir(path: &std::path::Path) -> Result<(), CliError> {
    if strata_core::dir::catalog_path(path).exists() {
        Ok(())
    } else {
        Err(CliError::NotADataDir(path.display().to_string()))
    }
}
