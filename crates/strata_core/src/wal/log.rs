//! The segmented write-ahead log of one database.

use crate::error::{CoreError, CoreResult};
use crate::memory::BufferPool;
use crate::types::{DatabaseId, Lsn};
use crate::wal::record::WalRecord;
use crate::wal::segment::{list_segments, scan_segment, segment_file_name, SegmentScan};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_storage::{FileBackend, StorageBackend};

/// Records recovered from a WAL directory.
#[derive(Debug, Default)]
pub struct WalReplay {
    /// Every intact record, in LSN order.
    pub records: Vec<WalRecord>,
    /// Whether the last segment ended in a partially written record.
    pub torn_tail: bool,
}

/// Metadata about one segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Segment ID (the hex part of the file name).
    pub id: u64,
    /// Path of the segment file.
    pub path: PathBuf,
    /// Highest LSN stored in the segment, if any.
    pub last_lsn: Option<Lsn>,
    /// Size in bytes.
    pub size: u64,
    /// Whether this is the segment currently appended to.
    pub active: bool,
}

struct Sealed {
    id: u64,
    path: PathBuf,
    last_lsn: Option<Lsn>,
    size: u64,
}

struct WalInner {
    active: FileBackend,
    active_id: u64,
    active_last: Option<Lsn>,
    sealed: Vec<Sealed>,
    next_lsn: u64,
}

/// Append-only, segmented, CRC-checked log.
///
/// Appends are serialized by an internal lock, so LSNs are strictly
/// increasing in file order. Appending does not sync; callers that need a
/// record to be durable call [`Wal::sync`] afterwards.
pub struct Wal {
    dir: PathBuf,
    db_id: DatabaseId,
    segment_size: u64,
    buffers: Arc<BufferPool>,
    inner: Mutex<WalInner>,
    last_lsn: AtomicU64,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("dir", &self.dir)
            .field("db_id", &self.db_id)
            .field("segment_size", &self.segment_size)
            .field("last_lsn", &self.current_lsn())
            .finish_non_exhaustive()
    }
}

/// Validates segment scans in order and accumulates their records.
struct ReplayCheck {
    db_id: DatabaseId,
    prev: Option<Lsn>,
    replay: WalReplay,
}

impl ReplayCheck {
    fn new(db_id: DatabaseId) -> Self {
        Self {
            db_id,
            prev: None,
            replay: WalReplay::default(),
        }
    }

    /// Accepts one segment's scan; returns whether it ended in a torn tail.
    fn accept(&mut self, id: u64, scan: SegmentScan, is_last: bool) -> CoreResult<bool> {
        let torn = match &scan.stop {
            None => false,
            Some(stop) if is_last && stop.is_torn_write() => true,
            Some(stop) => {
                return Err(CoreError::corruption(format!(
                    "WAL segment {} is damaged at offset {}: {stop}",
                    segment_file_name(id),
                    scan.valid_len
                )))
            }
        };

        for record in scan.records {
            if record.db_id != self.db_id {
                return Err(CoreError::corruption(format!(
                    "record at {} belongs to {}, expected {}",
                    record.lsn, record.db_id, self.db_id
                )));
            }
            if let Some(prev) = self.prev {
                if record.lsn <= prev {
                    return Err(CoreError::corruption(format!(
                        "non-increasing LSN {} after {prev} in {}",
                        record.lsn,
                        segment_file_name(id)
                    )));
                }
            }
            self.prev = Some(record.lsn);
            self.replay.records.push(record);
        }
        self.replay.torn_tail |= torn;
        Ok(torn)
    }
}

impl Wal {
    /// Opens (or creates) the WAL in `dir` and replays it.
    ///
    /// A partially written record at the end of the last segment is
    /// truncated away and reported through [`WalReplay::torn_tail`]. Any
    /// other damage fails with `Corruption`. New records get LSNs of at
    /// least `min_next_lsn`, which lets a checkpoint carry the LSN sequence
    /// forward after every segment it covered has been removed.
    pub fn open(
        dir: &Path,
        db_id: DatabaseId,
        segment_size: u64,
        buffers: Arc<BufferPool>,
        min_next_lsn: Lsn,
    ) -> CoreResult<(Self, WalReplay)> {
        std::fs::create_dir_all(dir)?;
        let files = list_segments(dir)?;
        let mut check = ReplayCheck::new(db_id);
        let mut sealed = Vec::new();
        let mut active = None;

        let count = files.len();
        for (idx, (id, path)) in files.into_iter().enumerate() {
            let is_last = idx + 1 == count;
            let mut backend = FileBackend::open(&path)?;
            let scan = scan_segment(&backend)?;
            let valid_len = scan.valid_len;
            let size = scan.size;
            let before = check.prev;
            let torn = check.accept(id, scan, is_last)?;
            let last_lsn = if check.prev == before { None } else { check.prev };

            if torn {
                tracing::warn!(
                    db = %db_id,
                    segment = %path.display(),
                    valid_len,
                    dropped = size - valid_len,
                    "truncating torn WAL tail"
                );
                backend.truncate(valid_len)?;
                backend.sync()?;
            }

            if is_last {
                active = Some((id, backend, last_lsn));
            } else {
                sealed.push(Sealed {
                    id,
                    path,
                    last_lsn,
                    size,
                });
            }
        }

        let (active_id, active, active_last) = match active {
            Some(found) => found,
            None => {
                let backend = FileBackend::open(&dir.join(segment_file_name(1)))?;
                (1, backend, None)
            }
        };

        let last = check.prev.map_or(0, Lsn::as_u64);
        let next_lsn = (last + 1).max(min_next_lsn.as_u64()).max(1);
        tracing::debug!(
            db = %db_id,
            records = check.replay.records.len(),
            segments = sealed.len() + 1,
            next_lsn,
            "WAL opened"
        );

        let wal = Self {
            dir: dir.to_path_buf(),
            db_id,
            segment_size,
            buffers,
            inner: Mutex::new(WalInner {
                active,
                active_id,
                active_last,
                sealed,
                next_lsn,
            }),
            last_lsn: AtomicU64::new(next_lsn - 1),
        };
        Ok((wal, check.replay))
    }

    /// Reads every record in `dir` without opening the WAL for writing.
    ///
    /// Applies the same damage rules as [`Wal::open`] but never truncates.
    pub fn read_dir(dir: &Path, db_id: DatabaseId) -> CoreResult<WalReplay> {
        let files = list_segments(dir)?;
        let mut check = ReplayCheck::new(db_id);
        let count = files.len();
        for (idx, (id, path)) in files.into_iter().enumerate() {
            let backend = FileBackend::open(&path)?;
            check.accept(id, scan_segment(&backend)?, idx + 1 == count)?;
        }
        Ok(check.replay)
    }

    /// Directory holding the segments.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends a record, assigning it the next LSN.
    ///
    /// Rotates to a new segment once the active one reaches the configured
    /// size.
    pub fn append(&self, record: &mut WalRecord) -> CoreResult<Lsn> {
        let mut inner = self.inner.lock();
        let lsn = Lsn::new(inner.next_lsn);
        record.lsn = lsn;

        let mut buf = self.buffers.get(record.frame_len());
        buf.clear();
        let written = record
            .encode_into(&mut buf)
            .and_then(|()| inner.active.append(&buf).map_err(CoreError::from));
        self.buffers.put(buf);
        if let Err(err) = written {
            record.lsn = Lsn::ZERO;
            return Err(err);
        }

        inner.next_lsn += 1;
        inner.active_last = Some(lsn);
        self.last_lsn.store(lsn.as_u64(), Ordering::Release);

        if inner.active.size()? >= self.segment_size {
            if let Err(err) = self.rotate_locked(&mut inner) {
                tracing::warn!(db = %self.db_id, error = %err, "WAL rotation failed; retrying on next append");
            }
        }
        Ok(lsn)
    }

    /// Forces the active segment to durable storage.
    pub fn sync(&self) -> CoreResult<()> {
        self.inner.lock().active.sync()?;
        Ok(())
    }

    /// Highest LSN assigned so far (zero for an empty log).
    #[must_use]
    pub fn current_lsn(&self) -> Lsn {
        Lsn::new(self.last_lsn.load(Ordering::Acquire))
    }

    /// Seals the active segment and starts a new one.
    ///
    /// Does nothing when the active segment is empty. Returns the ID of the
    /// segment now receiving appends.
    pub fn rotate(&self) -> CoreResult<u64> {
        let mut inner = self.inner.lock();
        if inner.active.size()? == 0 {
            return Ok(inner.active_id);
        }
        self.rotate_locked(&mut inner)
    }

    fn rotate_locked(&self, inner: &mut WalInner) -> CoreResult<u64> {
        inner.active.sync()?;
        let new_id = inner.active_id + 1;
        let fresh = FileBackend::open(&self.dir.join(segment_file_name(new_id)))?;
        let old = std::mem::replace(&mut inner.active, fresh);
        let size = old.size()?;
        inner.sealed.push(Sealed {
            id: inner.active_id,
            path: old.path().to_path_buf(),
            last_lsn: inner.active_last.take(),
            size,
        });
        inner.active_id = new_id;
        tracing::debug!(db = %self.db_id, segment = new_id, "WAL rotated");
        Ok(new_id)
    }

    /// Deletes sealed segments whose records all precede `lsn`.
    ///
    /// Only a contiguous prefix of the sealed segments is removed, so the
    /// remaining log has no holes. Returns the number of files deleted.
    pub fn remove_segments_before(&self, lsn: Lsn) -> CoreResult<usize> {
        let mut inner = self.inner.lock();
        let removable = inner
            .sealed
            .iter()
            .take_while(|seg| seg.last_lsn.map_or(true, |last| last < lsn))
            .count();
        let mut removed = 0;
        for seg in inner.sealed.drain(..removable) {
            match std::fs::remove_file(&seg.path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        if removed > 0 {
            tracing::debug!(db = %self.db_id, removed, before = %lsn, "removed WAL segments");
        }
        Ok(removed)
    }

    /// Re-reads every record from disk.
    pub fn read_all_records(&self) -> CoreResult<WalReplay> {
        let mut inner = self.inner.lock();
        inner.active.flush()?;
        let mut check = ReplayCheck::new(self.db_id);
        for seg in &inner.sealed {
            let backend = FileBackend::open(&seg.path)?;
            check.accept(seg.id, scan_segment(&backend)?, false)?;
        }
        check.accept(inner.active_id, scan_segment(&inner.active)?, true)?;
        Ok(check.replay)
    }

    /// Alias of [`Wal::read_all_records`] used by recovery paths.
    pub fn recover(&self) -> CoreResult<WalReplay> {
        self.read_all_records()
    }

    /// Segment metadata, oldest first.
    pub fn segments(&self) -> CoreResult<Vec<SegmentInfo>> {
        let inner = self.inner.lock();
        let mut out: Vec<SegmentInfo> = inner
            .sealed
            .iter()
            .map(|seg| SegmentInfo {
                id: seg.id,
                path: seg.path.clone(),
                last_lsn: seg.last_lsn,
                size: seg.size,
                active: false,
            })
            .collect();
        out.push(SegmentInfo {
            id: inner.active_id,
            path: inner.active.path().to_path_buf(),
            last_lsn: inner.active_last,
            size: inner.active.size()?,
            active: true,
        });
        Ok(out)
    }

    /// Total bytes across all segments.
    pub fn size_bytes(&self) -> CoreResult<u64> {
        Ok(self.segments()?.iter().map(|seg| seg.size).sum())
    }
}
