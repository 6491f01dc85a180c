//! Write-ahead log: the source of truth for every database.
//!
//! Each database owns a directory of numbered segment files. Every mutation
//! is appended here before it becomes visible, and recovery rebuilds the
//! in-memory state from the log (plus the latest checkpoint).
//!
//! ## Record format
//!
//! ```text
//! | body_len (4) | lsn (8) | tx_id (8) | db_id (8) | op (1) | doc_id (8) |
//! | coll_len (2) | collection | payload_len (4) | payload | crc32 (4) |
//! ```
//!
//! All integers are little-endian. The CRC covers the body up to itself.
//!
//! ## Damage policy
//!
//! Replay stops at a short read, a zero or oversized length prefix, or a
//! checksum failure. That is tolerated only at the very end of the last
//! segment (a write interrupted by a crash) and the tail is truncated on
//! open. The same damage anywhere else fails the open with `Corruption`.
//! A record whose LSN does not exceed its predecessor's is also
//! `Corruption`.

mod log;
mod record;
mod segment;

pub use log::{SegmentInfo, Wal, WalReplay};
pub use record::{OpType, WalRecord, FIXED_BODY_LEN, LEN_PREFIX, MAX_BODY_LEN, MAX_COLLECTION_LEN};
pub use segment::{
    list_segments, parse_segment_file_name, scan_segment, segment_file_name, ScanStop,
    SegmentScan,
};
