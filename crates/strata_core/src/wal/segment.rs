//! WAL segment files and the per-segment scanner.

use crate::error::CoreResult;
use crate::wal::record::{WalRecord, LEN_PREFIX, MAX_BODY_LEN};
use std::fmt;
use std::path::{Path, PathBuf};
use strata_storage::StorageBackend;

/// File name prefix of WAL segments.
const SEGMENT_PREFIX: &str = "wal-";
/// File name suffix of WAL segments.
const SEGMENT_SUFFIX: &str = ".log";

/// File name of segment `id`: `wal-<016x>.log`.
#[must_use]
pub fn segment_file_name(id: u64) -> String {
    format!("{SEGMENT_PREFIX}{id:016x}{SEGMENT_SUFFIX}")
}

/// Parses a segment ID out of a file name.
#[must_use]
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

/// Segment IDs and paths in `dir`, ascending.
pub fn list_segments(dir: &Path) -> CoreResult<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(parse_segment_file_name) {
            segments.push((id, entry.path()));
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

/// Why a scan stopped before the end of the segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStop {
    /// Fewer bytes remain than the frame needs.
    ShortRead,
    /// Length prefix is zero and only zero bytes follow.
    ZeroFill,
    /// Length prefix is zero or oversized with data after it.
    BadLength(u32),
    /// Body failed to decode.
    BadRecord {
        /// Decoder message.
        reason: String,
        /// Whether any bytes follow the damaged record.
        followed_by_data: bool,
    },
}

impl ScanStop {
    /// Whether the damage looks like an interrupted final write.
    ///
    /// Only meaningful for the last segment; damage anywhere else is fatal.
    #[must_use]
    pub fn is_torn_write(&self) -> bool {
        match self {
            Self::ShortRead | Self::ZeroFill => true,
            Self::BadLength(len) => *len as usize > MAX_BODY_LEN,
            Self::BadRecord {
                followed_by_data, ..
            } => !followed_by_data,
        }
    }
}

impl fmt::Display for ScanStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortRead => f.write_str("short read"),
            Self::ZeroFill => f.write_str("zero-filled tail"),
            Self::BadLength(len) => write!(f, "invalid record length {len}"),
            Self::BadRecord { reason, .. } => f.write_str(reason),
        }
    }
}

/// Result of scanning one segment.
#[derive(Debug)]
pub struct SegmentScan {
    /// Records decoded before the scan stopped.
    pub records: Vec<WalRecord>,
    /// Bytes covered by those records.
    pub valid_len: u64,
    /// Total segment size.
    pub size: u64,
    /// Set when the scan stopped before `size`.
    pub stop: Option<ScanStop>,
}

/// Decodes every intact record at the front of a segment.
pub fn scan_segment(backend: &dyn StorageBackend) -> CoreResult<SegmentScan> {
    let size = backend.size()?;
    let data = backend.read_to_end(0)?;
    let mut records = Vec::new();
    let mut offset = 0usize;

    let stop = loop {
        let remaining = data.len() - offset;
        if remaining == 0 {
            break None;
        }
        if remaining < LEN_PREFIX {
            break Some(ScanStop::ShortRead);
        }
        let len = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        if len == 0 {
            let zero_tail = data[offset..].iter().all(|&b| b == 0);
            break Some(if zero_tail {
                ScanStop::ZeroFill
            } else {
                ScanStop::BadLength(0)
            });
        }
        if len as usize > MAX_BODY_LEN {
            break Some(ScanStop::BadLength(len));
        }
        let end = offset + LEN_PREFIX + len as usize;
        if end > data.len() {
            break Some(ScanStop::ShortRead);
        }
        match WalRecord::decode_body(&data[offset + LEN_PREFIX..end]) {
            Ok(record) => records.push(record),
            Err(err) => {
                break Some(ScanStop::BadRecord {
                    reason: err.to_string(),
                    followed_by_data: end < data.len(),
                })
            }
        }
        offset = end;
    };

    Ok(SegmentScan {
        records,
        valid_len: offset as u64,
        size,
        stop,
    })
}
