//! Data directory layout and locking.
//!
//! ```text
//! <data_dir>/
//! ├─ LOCK                      # advisory lock, one engine per directory
//! ├─ catalog.dat               # catalog records
//! └─ db-<id:016x>/
//!    ├─ checkpoint-<lsn:016x>.ckpt
//!    └─ wal/
//!       └─ wal-<seg:016x>.log
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::DatabaseId;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const CATALOG_FILE: &str = "catalog.dat";
const WAL_DIR: &str = "wal";

/// Path of the catalog file under `root`.
#[must_use]
pub fn catalog_path(root: &Path) -> PathBuf {
    root.join(CATALOG_FILE)
}

/// Directory holding one database's files.
#[must_use]
pub fn database_path(root: &Path, db_id: DatabaseId) -> PathBuf {
    root.join(format!("db-{:016x}", db_id.as_u64()))
}

/// WAL directory of one database.
#[must_use]
pub fn wal_path(root: &Path, db_id: DatabaseId) -> PathBuf {
    database_path(root, db_id).join(WAL_DIR)
}

/// An exclusively locked data directory.
///
/// The lock is held for the lifetime of the value and released when the
/// file handle is closed.
#[derive(Debug)]
pub struct DataDir {
    path: PathBuf,
    _lock_file: File,
}

impl DataDir {
    /// Opens (optionally creating) a data directory and takes its lock.
    ///
    /// # Errors
    ///
    /// `DatabaseLocked` if another handle holds the lock; `InvalidArgument`
    /// if the path is missing (and `create_if_missing` is false) or is not a
    /// directory.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_argument(format!(
                    "data directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_argument(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Root of the data directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the catalog file.
    #[must_use]
    pub fn catalog_path(&self) -> PathBuf {
        catalog_path(&self.path)
    }

    /// Directory of one database.
    #[must_use]
    pub fn database_path(&self, db_id: DatabaseId) -> PathBuf {
        database_path(&self.path, db_id)
    }

    /// Deletes every file belonging to a database.
    ///
    /// Missing directories are not an error.
    pub fn remove_database_files(&self, db_id: DatabaseId) -> CoreResult<()> {
        let path = self.database_path(db_id);
        match fs::remove_dir_all(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        sync_directory(&self.path)
    }
}

/// Syncs a directory so created, renamed or deleted entries are durable.
#[cfg(unix)]
pub(crate) fn sync_directory(path: &Path) -> CoreResult<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

/// NTFS journals metadata; there is no directory handle to sync.
#[cfg(not(unix))]
pub(crate) fn sync_directory(_path: &Path) -> CoreResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("data");
        let dir = DataDir::open(&root, true).unwrap();
        assert!(root.is_dir());
        assert_eq!(dir.catalog_path(), root.join("catalog.dat"));
    }

    #[test]
    fn open_fails_if_missing_and_no_create() {
        let temp = tempdir().unwrap();
        assert!(DataDir::open(&temp.path().join("absent"), false).is_err());
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let _first = DataDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            DataDir::open(temp.path(), true),
            Err(CoreError::DatabaseLocked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(DataDir::open(temp.path(), true).unwrap());
        DataDir::open(temp.path(), true).unwrap();
    }

    #[test]
    fn layout_paths() {
        let root = Path::new("/srv/strata");
        let id = DatabaseId::new(26);
        assert_eq!(
            database_path(root, id),
            root.join("db-000000000000001a")
        );
        assert_eq!(
            wal_path(root, id),
            root.join("db-000000000000001a").join("wal")
        );
    }

    #[test]
    fn remove_database_files_is_idempotent() {
        let temp = tempdir().unwrap();
        let dir = DataDir::open(temp.path(), true).unwrap();
        let id = DatabaseId::new(3);
        fs::create_dir_all(wal_path(temp.path(), id)).unwrap();
        dir.remove_database_files(id).unwrap();
        assert!(!dir.database_path(id).exists());
        dir.remove_database_files(id).unwrap();
    }
}
