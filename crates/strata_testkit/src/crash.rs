//! Crash simulation for recovery tests.
//!
//! A crash is simulated by stopping the engine and then damaging the newest
//! WAL segment the way an interrupted write or bad media would.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strata_testkit::prelude::*;
//!
//! env.kill();
//! inflict(env.path(), db, CrashPoint::TornTail)?;
//! env.start();
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use strata_core::dir::wal_path;
use strata_core::wal::list_segments;
use strata_core::DatabaseId;

/// Kinds of on-disk damage a crash can leave behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// A partial record after the last complete one.
    TornTail,
    /// The last record cut short by `n` bytes.
    TruncatedRecord(u64),
    /// Preallocated zeros after the last record.
    ZeroFilledTail,
    /// A flipped byte inside the first record; later records are intact.
    CorruptMiddle,
}

impl CrashPoint {
    /// Whether recovery is expected to tolerate this damage.
    #[must_use]
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::CorruptMiddle)
    }
}

/// Path of the newest WAL segment of `db`.
pub fn latest_segment(root: &Path, db: DatabaseId) -> io::Result<PathBuf> {
    list_segments(&wal_path(root, db))
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
        .pop()
        .map(|(_, path)| path)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no WAL segments"))
}

/// Appends raw bytes to a file.
pub fn append_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Removes the last `n` bytes of a file.
pub fn truncate_tail(path: &Path, n: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();
    file.set_len(len.saturating_sub(n))?;
    file.sync_all()
}

/// XORs the byte at `offset` with `0xff`.
pub fn flip_byte(path: &Path, offset: usize) -> io::Result<()> {
    let mut bytes = fs::read(path)?;
    let byte = bytes
        .get_mut(offset)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset past end of file"))?;
    *byte ^= 0xff;
    fs::write(path, bytes)
}

/// Damages the newest WAL segment of `db` as `point` describes.
pub fn inflict(root: &Path, db: DatabaseId, point: CrashPoint) -> io::Result<()> {
    let segment = latest_segment(root, db)?;
    match point {
        // Length prefix promising 64 bytes, followed by only a few.
        CrashPoint::TornTail => append_bytes(&segment, &[64, 0, 0, 0, 0xde, 0xad, 0xbe]),
        CrashPoint::TruncatedRecord(n) => truncate_tail(&segment, n),
        CrashPoint::ZeroFilledTail => append_bytes(&segment, &[0; 256]),
        CrashPoint::CorruptMiddle => flip_byte(&segment, 12),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use strata_core::wal::WalRecord;
    use tempfile::tempdir;

    #[test]
    fn file_helpers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, [1, 2, 3, 4]).unwrap();

        append_bytes(&path, &[5]).unwrap();
        truncate_tail(&path, 2).unwrap();
        flip_byte(&path, 0).unwrap();
        assert_eq!(fs::read(&path).unwrap(), [0xfe, 2, 3]);
        assert!(flip_byte(&path, 10).is_err());
    }

    #[test]
    fn missing_wal_is_not_found() {
        let dir = tempdir().unwrap();
        let err = latest_segment(dir.path(), DatabaseId::new(1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    proptest! {
        #[test]
        fn decoding_garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = WalRecord::decode_body(&bytes);
        }
    }
}
