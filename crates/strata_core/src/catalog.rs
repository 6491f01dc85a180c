//! Durable registry of logical databases.
//!
//! The catalog file is an append-only sequence of records:
//!
//! ```text
//! | db_id (8, LE) | name_len (2, LE) | status (1) | name (name_len) |
//! ```
//!
//! Status 1 marks a database active, 2 deleted. Loading replays every
//! record in order; a trailing record cut short by a crash is dropped.

use crate::error::{CoreError, CoreResult, Missing};
use crate::types::{unix_millis, DatabaseId};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use strata_storage::{FileBackend, StorageBackend};

/// Header bytes in front of each name.
const RECORD_HEADER: usize = 8 + 2 + 1;

/// Longest accepted database name in bytes.
pub const MAX_NAME_LEN: usize = 64;

/// Lifecycle state of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseStatus {
    /// Usable and addressable by name.
    Active,
    /// Dropped; the ID is never reused.
    Deleted,
}

impl DatabaseStatus {
    fn as_byte(self) -> u8 {
        match self {
            Self::Active => 1,
            Self::Deleted => 2,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Active),
            2 => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// One database known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    /// Assigned ID.
    pub db_id: DatabaseId,
    /// Name, unique among active entries.
    pub name: String,
    /// Current status.
    pub status: DatabaseStatus,
    /// Unix millis of creation, or of the load that recovered the entry.
    pub created_at: u64,
}

/// Checks a database name.
///
/// Names are 1 to 64 bytes of `[A-Za-z0-9_.-]` and may not start with `.`.
pub fn validate_name(name: &str) -> CoreResult<()> {
    if name.is_empty() {
        return Err(CoreError::invalid_argument("database name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CoreError::invalid_argument(format!(
            "database name is {} bytes, limit is {MAX_NAME_LEN}",
            name.len()
        )));
    }
    if name.starts_with('.') {
        return Err(CoreError::invalid_argument(format!(
            "database name {name:?} starts with '.'"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(CoreError::invalid_argument(format!(
            "database name {name:?} contains {bad:?}"
        )));
    }
    Ok(())
}

fn encode_record(db_id: DatabaseId, name: &str, status: DatabaseStatus) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER + name.len());
    buf.extend_from_slice(&db_id.as_u64().to_le_bytes());
    buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
    buf.push(status.as_byte());
    buf.extend_from_slice(name.as_bytes());
    buf
}

struct CatalogState {
    backend: Box<dyn StorageBackend>,
    entries: BTreeMap<DatabaseId, CatalogEntry>,
    names: HashMap<String, DatabaseId>,
    next_id: u64,
}

impl CatalogState {
    fn apply(&mut self, db_id: DatabaseId, name: String, status: DatabaseStatus, at: u64) {
        match status {
            DatabaseStatus::Active => {
                self.names.insert(name.clone(), db_id);
            }
            DatabaseStatus::Deleted => {
                if self.names.get(&name) == Some(&db_id) {
                    self.names.remove(&name);
                }
            }
        }
        self.entries
            .entry(db_id)
            .and_modify(|entry| entry.status = status)
            .or_insert(CatalogEntry {
                db_id,
                name,
                status,
                created_at: at,
            });
        self.next_id = self.next_id.max(db_id.as_u64() + 1);
    }

    /// Appends and syncs one record. On failure the file is cut back to its
    /// previous length so a later load cannot resurrect the record.
    fn persist(&mut self, db_id: DatabaseId, name: &str, status: DatabaseStatus) -> CoreResult<()> {
        let len = self.backend.size()?;
        let written = self
            .backend
            .append(&encode_record(db_id, name, status))
            .and_then(|_| self.backend.sync());
        if let Err(err) = written {
            if let Err(undo) = self.backend.truncate(len) {
                tracing::error!(db = %db_id, error = %undo, "catalog rollback failed");
            }
            return Err(err.into());
        }
        Ok(())
    }
}

/// Name → ID → status registry, persisted to `catalog.dat`.
///
/// Mutations append and sync a record before the in-memory maps change, so
/// a failed write leaves the catalog exactly as it was.
pub struct Catalog {
    state: RwLock<CatalogState>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Catalog")
            .field("entries", &state.entries.len())
            .field("next_id", &state.next_id)
            .finish_non_exhaustive()
    }
}

impl Catalog {
    /// Opens the catalog file at `path`, creating it if missing.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        Self::with_backend(Box::new(backend))
    }

    /// Loads a catalog from an arbitrary backend.
    ///
    /// # Errors
    ///
    /// Returns `Corruption` for a complete record with an unknown status
    /// byte or a non-UTF-8 name.
    pub fn with_backend(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let data = backend.read_to_end(0)?;
        let now = unix_millis();
        let mut state = CatalogState {
            backend,
            entries: BTreeMap::new(),
            names: HashMap::new(),
            next_id: 1,
        };

        let mut offset = 0usize;
        while data.len() - offset >= RECORD_HEADER {
            let header = &data[offset..offset + RECORD_HEADER];
            let mut id_bytes = [0u8; 8];
            id_bytes.copy_from_slice(&header[..8]);
            let db_id = DatabaseId::new(u64::from_le_bytes(id_bytes));
            let name_len = u16::from_le_bytes([header[8], header[9]]) as usize;
            let end = offset + RECORD_HEADER + name_len;
            if end > data.len() {
                break;
            }
            let status = DatabaseStatus::from_byte(header[10]).ok_or_else(|| {
                CoreError::corruption(format!(
                    "catalog record at offset {offset} has status byte {}",
                    header[10]
                ))
            })?;
            let name = std::str::from_utf8(&data[offset + RECORD_HEADER..end])
                .map_err(|_| {
                    CoreError::corruption(format!(
                        "catalog record at offset {offset} has a non-UTF-8 name"
                    ))
                })?
                .to_string();
            state.apply(db_id, name, status, now);
            offset = end;
        }

        if offset < data.len() {
            tracing::warn!(
                valid_len = offset,
                dropped = data.len() - offset,
                "dropping truncated catalog record"
            );
            state.backend.truncate(offset as u64)?;
        }

        tracing::debug!(
            entries = state.entries.len(),
            next_id = state.next_id,
            "catalog loaded"
        );
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Registers a new active database and returns its ID.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a bad name, `AlreadyExists` if an active
    /// database already has it.
    pub fn create(&self, name: &str) -> CoreResult<DatabaseId> {
        validate_name(name)?;
        let mut state = self.state.write();
        if state.names.contains_key(name) {
            return Err(CoreError::already_exists(name));
        }
        let db_id = DatabaseId::new(state.next_id);
        state.persist(db_id, name, DatabaseStatus::Active)?;
        state.apply(db_id, name.to_string(), DatabaseStatus::Active, unix_millis());
        tracing::info!(db = %db_id, name, "database created");
        Ok(db_id)
    }

    /// Marks a database deleted.
    ///
    /// # Errors
    ///
    /// `NotFound` if the ID is unknown or already deleted.
    pub fn delete(&self, db_id: DatabaseId) -> CoreResult<()> {
        let mut state = self.state.write();
        let name = match state.entries.get(&db_id) {
            Some(entry) if entry.status == DatabaseStatus::Active => entry.name.clone(),
            _ => return Err(CoreError::not_found(Missing::Database, db_id)),
        };
        state.persist(db_id, &name, DatabaseStatus::Deleted)?;
        state.apply(db_id, name.clone(), DatabaseStatus::Deleted, unix_millis());
        tracing::info!(db = %db_id, name, "database deleted");
        Ok(())
    }

    /// Looks up an entry by ID, active or deleted.
    pub fn get(&self, db_id: DatabaseId) -> CoreResult<CatalogEntry> {
        self.state
            .read()
            .entries
            .get(&db_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(Missing::Database, db_id))
    }

    /// Resolves an active database by name.
    pub fn get_by_name(&self, name: &str) -> CoreResult<DatabaseId> {
        self.state
            .read()
            .names
            .get(name)
            .copied()
            .ok_or_else(|| CoreError::not_found(Missing::Database, name))
    }

    /// Active entries ordered by ID.
    #[must_use]
    pub fn list(&self) -> Vec<CatalogEntry> {
        self.state
            .read()
            .entries
            .values()
            .filter(|entry| entry.status == DatabaseStatus::Active)
            .cloned()
            .collect()
    }

    /// Every entry, deleted ones included, ordered by ID.
    #[must_use]
    pub fn list_all(&self) -> Vec<CatalogEntry> {
        self.state.read().entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_storage::InMemoryBackend;

    fn catalog_over(backend: &InMemoryBackend) -> Catalog {
        Catalog::with_backend(Box::new(backend.clone())).unwrap()
    }

    #[test]
    fn create_get_list() {
        let catalog = catalog_over(&InMemoryBackend::new());
        let a = catalog.create("alpha").unwrap();
        let b = catalog.create("beta").unwrap();
        assert_eq!(a, DatabaseId::new(1));
        assert_eq!(b, DatabaseId::new(2));

        assert_eq!(catalog.get_by_name("beta").unwrap(), b);
        assert_eq!(catalog.get(a).unwrap().name, "alpha");
        let names: Vec<_> = catalog.list().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["alpha", "beta"]);
    }

    #[test]
    fn duplicate_active_name_rejected() {
        let catalog = catalog_over(&InMemoryBackend::new());
        catalog.create("orders").unwrap();
        let err = catalog.create("orders").unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists { .. }));
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("app_1.v2-x").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("slash/name").is_err());
        assert!(validate_name(&"n".repeat(MAX_NAME_LEN)).is_ok());
        assert!(validate_name(&"n".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn delete_semantics() {
        let catalog = catalog_over(&InMemoryBackend::new());
        let id = catalog.create("temp").unwrap();
        catalog.delete(id).unwrap();

        assert_eq!(catalog.get(id).unwrap().status, DatabaseStatus::Deleted);
        assert!(catalog.get_by_name("temp").is_err());
        assert!(catalog.list().is_empty());
        assert_eq!(catalog.list_all().len(), 1);

        assert!(matches!(
            catalog.delete(id),
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(
            catalog.delete(DatabaseId::new(99)),
            Err(CoreError::NotFound { .. })
        ));

        let again = catalog.create("temp").unwrap();
        assert_ne!(again, id);
    }

    #[test]
    fn reload_round_trip() {
        let backend = InMemoryBackend::new();
        let (foo, gone) = {
            let catalog = catalog_over(&backend);
            let foo = catalog.create("foo").unwrap();
            let gone = catalog.create("gone").unwrap();
            catalog.delete(gone).unwrap();
            (foo, gone)
        };

        let reloaded = catalog_over(&backend);
        assert_eq!(reloaded.get_by_name("foo").unwrap(), foo);
        assert!(reloaded.list().iter().all(|e| e.db_id != gone));
        assert_eq!(reloaded.get(gone).unwrap().status, DatabaseStatus::Deleted);
        assert_eq!(reloaded.create("next").unwrap(), DatabaseId::new(3));
    }

    #[test]
    fn truncated_trailing_record_is_dropped() {
        let backend = InMemoryBackend::new();
        catalog_over(&backend).create("kept").unwrap();
        let mut bytes = backend.data();
        bytes.extend_from_slice(&encode_record(DatabaseId::new(2), "lost", DatabaseStatus::Active)[..6]);

        let damaged = InMemoryBackend::with_data(bytes);
        let catalog = catalog_over(&damaged);
        assert_eq!(catalog.list().len(), 1);

        let id = catalog.create("after").unwrap();
        assert_eq!(id, DatabaseId::new(2));
        let reloaded = catalog_over(&damaged);
        assert_eq!(reloaded.get_by_name("after").unwrap(), id);
    }

    #[test]
    fn unknown_status_is_corruption() {
        let mut bytes = encode_record(DatabaseId::new(1), "x", DatabaseStatus::Active);
        bytes[10] = 7;
        let err = Catalog::with_backend(Box::new(InMemoryBackend::with_data(bytes))).unwrap_err();
        assert!(matches!(err, CoreError::Corruption { .. }));
    }

    #[test]
    fn failed_write_leaves_state_unchanged() {
        let backend = InMemoryBackend::new();
        let catalog = catalog_over(&backend);
        catalog.create("first").unwrap();

        backend.fail_appends_after(0);
        assert!(catalog.create("second").is_err());
        assert!(catalog.get_by_name("second").is_err());
        assert_eq!(catalog.list().len(), 1);

        backend.heal();
        assert_eq!(catalog.create("second").unwrap(), DatabaseId::new(2));
    }

    #[test]
    fn failed_sync_does_not_leak_the_record() {
        let backend = InMemoryBackend::new();
        let catalog = catalog_over(&backend);
        let kept = catalog.create("kept").unwrap();
        let synced_len = backend.data().len();

        backend.fail_syncs();
        assert!(catalog.create("lost").is_err());
        assert!(catalog.delete(kept).is_err());
        assert_eq!(backend.data().len(), synced_len);
        assert!(catalog.get_by_name("lost").is_err());
        assert_eq!(catalog.get(kept).unwrap().status, DatabaseStatus::Active);

        backend.heal();
        let next = catalog.create("other").unwrap();
        assert_eq!(next, DatabaseId::new(2));

        let reloaded = catalog_over(&backend);
        assert!(reloaded.get_by_name("lost").is_err());
        assert_eq!(reloaded.get_by_name("other").unwrap(), next);
        assert_eq!(reloaded.get_by_name("kept").unwrap(), kept);
        assert_eq!(reloaded.list().len(), 2);
    }

    #[test]
    fn file_backed_catalog_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.dat");
        let id = Catalog::open(&path).unwrap().create("disk").unwrap();
        assert_eq!(Catalog::open(&path).unwrap().get_by_name("disk").unwrap(), id);
    }
}
