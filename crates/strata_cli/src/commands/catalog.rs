//! Catalog listing.

use super::{ensure_data_dir, CliError, Format};
use strata_core::dir::catalog_path;
use strata_core::{Catalog, CatalogEntry, DatabaseStatus};
use std::path::Path;

/// Every catalog entry, deleted ones included, ordered by ID.
pub fn entries(path: &Path) -> Result<Vec<CatalogEntry>, CliError> {
    ensure_data_dir(path)?;
    let catalog = Catalog::open(&catalog_path(path))?;
    Ok(catalog.list_all())
}

/// Runs the catalog command.
pub fn run(path: &Path, format: Format) -> Result<(), CliError> {
    let entries = entries(path)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        Format::Text => {
            println!("Catalog ({} entries)", entries.len());
            println!("================");
            for entry in &entries {
                let status = match entry.status {
                    DatabaseStatus::Active => "active",
                    DatabaseStatus::Deleted => "deleted",
                };
                println!("{:>6}  {:<8} {}", entry.db_id.as_u64(), status, entry.name);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{Config, Engine};
    use tempfile::tempdir;

    #[test]
    fn lists_deleted_entries_too() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(Config::new(dir.path())).unwrap();
            engine.create_database("kept").unwrap();
            let gone = engine.create_database("gone").unwrap();
            engine.drop_database(gone).unwrap();
        }
        let entries = entries(dir.path()).unwrap();
        let summary: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.status)).collect();
        assert_eq!(
            summary,
            [("kept", DatabaseStatus::Active), ("gone", DatabaseStatus::Deleted)]
        );
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            entries(&dir.path().join("nothing")),
            Err(CliError::NotADataDir(_))
        ));
    }
}
