//! Strata CLI
//!
//! Command-line tools for Strata data directories.
//!
//! # Commands
//!
//! - `catalog` - List catalog entries, deleted ones included
//! - `dump-wal` - Dump one database's WAL records for debugging
//! - `verify` - Replay every active database's WAL and read back checkpoints
//! - `stats` - Open a database and print its statistics

mod commands;

use clap::{Parser, Subcommand};
use commands::Format;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Strata command-line data directory tools.
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
    #[arg(global = true, short, long, default_value = "./strata-data")]
    path: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List catalog entries
    Catalog {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Dump WAL records for debugging
    DumpWal {
        /// Database ID
        #[arg(short, long)]
        db: u64,

        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Verify WALs and checkpoints of every active database
    Verify,

    /// Open a database and print its statistics
    Stats {
        /// Database name
        #[arg(short, long)]
        db: String,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Show version information
    Version,
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Catalog { format } => commands::catalog::run(&cli.path, format),
        Commands::DumpWal { db, limit, format } => {
            commands::dump_wal::run(&cli.path, db, limit, format)
        }
        Commands::Verify => commands::verify::run(&cli.path),
        Commands::Stats { db, format } => commands::stats::run(&cli.path, &db, format),
        Commands::Version => {
            println!("Strata CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Strata Core v{}", strata_core::VERSION);
            Ok(())
        }
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "command failed");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
