//! Storage backend trait definition.

use crate::error::StorageResult;

/// An append-only byte store.
///
/// The catalog file and every WAL segment sit on one of these. Callers frame
/// their own records; the backend only guarantees that bytes handed to
/// `append` can be read back at the returned offset.
///
/// # Invariants
///
/// - `append` returns the offset of the first written byte
/// - `size` equals the offset the next `append` will return
/// - after `sync` returns, everything appended so far survives a crash
/// - `truncate` only shrinks; it is how recovery drops a torn trailing record
pub trait StorageBackend: Send + Sync {
    /// Reads exactly `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range is not fully
    /// inside the stored bytes.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails. A failed append leaves the
    /// visible size unchanged.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    fn flush(&mut self) -> StorageResult<()>;

    /// Forces data and metadata to stable storage.
    fn sync(&mut self) -> StorageResult<()>;

    /// Current size in bytes.
    fn size(&self) -> StorageResult<u64>;

    /// Shrinks the storage to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::TruncateBeyondEnd`] if `new_size` is
    /// larger than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Reads everything from `offset` to the end.
    fn read_to_end(&self, offset: u64) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        let len = size.saturating_sub(offset);
        self.read_at(offset, len as usize)
    }
}
