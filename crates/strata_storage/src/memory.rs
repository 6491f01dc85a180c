//! In-memory storage backend for tests.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// An in-memory backend.
///
/// Besides plain storage it can simulate the failure shapes recovery has to
/// cope with:
///
/// - [`InMemoryBackend::fail_appends_after`] makes later appends return an
///   error without changing the stored bytes
/// - [`InMemoryBackend::fail_syncs`] makes `sync` fail after the bytes were
///   already appended
/// - [`InMemoryBackend::with_data`] preloads arbitrary (possibly torn or
///   corrupted) bytes
///
/// Clones share the same bytes, which lets a test keep a handle after giving
/// one to a catalog or WAL segment.
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
    appends_left: Arc<AtomicUsize>,
    syncs_fail: Arc<AtomicBool>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(Vec::new())),
            appends_left: Arc::new(AtomicUsize::new(usize::MAX)),
            syncs_fail: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a backend holding `data`.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        let backend = Self::new();
        *backend.data.write() = data;
        backend
    }

    /// Copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Lets `count` more appends succeed, then fails every following one.
    pub fn fail_appends_after(&self, count: usize) {
        self.appends_left.store(count, Ordering::SeqCst);
    }

    /// Makes every following `sync` fail until [`InMemoryBackend::heal`].
    pub fn fail_syncs(&self) {
        self.syncs_fail.store(true, Ordering::SeqCst);
    }

    /// Removes any injected failure.
    pub fn heal(&self) {
        self.appends_left.store(usize::MAX, Ordering::SeqCst);
        self.syncs_fail.store(false, Ordering::SeqCst);
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let permitted = self
            .appends_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                usize::MAX => Some(usize::MAX),
                0 => None,
                n => Some(n - 1),
            });
        if permitted.is_err() {
            return Err(StorageError::InjectedFailure);
        }

        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.syncs_fail.load(Ordering::SeqCst) {
            return Err(StorageError::InjectedFailure);
        }
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
        assert_eq!(backend.size().unwrap(), 11);
    }

    #[test]
    fn read_extending_past_end_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello").unwrap();
        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn clones_share_bytes() {
        let mut backend = InMemoryBackend::new();
        let observer = backend.clone();
        backend.append(b"shared").unwrap();
        assert_eq!(observer.data(), b"shared");
    }

    #[test]
    fn injected_failure_leaves_bytes_untouched() {
        let mut backend = InMemoryBackend::new();
        backend.fail_appends_after(1);

        backend.append(b"first").unwrap();
        assert!(matches!(
            backend.append(b"second"),
            Err(StorageError::InjectedFailure)
        ));
        assert_eq!(backend.data(), b"first");

        backend.heal();
        assert_eq!(backend.append(b"!").unwrap(), 5);
    }

    #[test]
    fn injected_sync_failure_keeps_appended_bytes() {
        let mut backend = InMemoryBackend::new();
        backend.fail_syncs();
        backend.append(b"unsynced").unwrap();
        assert!(matches!(backend.sync(), Err(StorageError::InjectedFailure)));
        assert_eq!(backend.data(), b"unsynced");

        backend.heal();
        backend.sync().unwrap();
    }

    #[test]
    fn truncate_shrinks_only() {
        let mut backend = InMemoryBackend::with_data(b"record+torn".to_vec());
        backend.truncate(6).unwrap();
        assert_eq!(backend.data(), b"record");
        assert!(backend.truncate(7).is_err());
    }
}
