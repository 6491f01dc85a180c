//! Checkpoint files.
//!
//! A checkpoint is the live state of a database at a WAL position (its
//! cut), written as a sequence of WAL-framed records so it shares the CRC
//! checking of the log:
//!
//! ```text
//! Checkpoint        lsn = cut, tx_id = watermark, doc_id = next id, payload = replay_from
//! CreateCollection  one per live collection, payload = created_at
//! Create            one per live document version
//! Commit            trailer, doc_id = number of entries, payload = cut
//! ```
//!
//! Recovery loads the newest checkpoint that decodes completely, then
//! replays transactions whose commit record lies after the cut.

use crate::dir::sync_directory;
use crate::error::{CoreError, CoreResult};
use crate::types::{DatabaseId, DocumentId, Lsn, TransactionId};
use crate::wal::{scan_segment, OpType, WalRecord};
use std::fs;
use std::path::{Path, PathBuf};
use strata_storage::{FileBackend, StorageBackend};

const PREFIX: &str = "checkpoint-";
const SUFFIX: &str = ".ckpt";
const TEMP_SUFFIX: &str = ".tmp";

/// A collection captured by a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointCollection {
    /// Collection name.
    pub name: String,
    /// Creating commit.
    pub created_tx: TransactionId,
    /// Unix millis of creation.
    pub created_at: u64,
}

/// A live document captured by a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointDocument {
    /// Owning collection.
    pub collection: String,
    /// Document ID.
    pub doc_id: DocumentId,
    /// Commit that created the live version.
    pub created_tx: TransactionId,
    /// Payload.
    pub payload: Vec<u8>,
}

/// Decoded contents of a checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointData {
    /// Every commit at or before this LSN is included.
    pub cut: Lsn,
    /// Oldest LSN recovery from this checkpoint may need.
    pub replay_from: Lsn,
    /// Newest commit included.
    pub watermark: TransactionId,
    /// Next transaction ID at the time of the checkpoint.
    pub next_id: u64,
    /// Live collections.
    pub collections: Vec<CheckpointCollection>,
    /// Live documents.
    pub documents: Vec<CheckpointDocument>,
}

/// File name of the checkpoint cut at `cut`.
#[must_use]
pub fn checkpoint_file_name(cut: Lsn) -> String {
    format!("{PREFIX}{:016x}{SUFFIX}", cut.as_u64())
}

fn parse_file_name(name: &str) -> Option<Lsn> {
    let hex = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok().map(Lsn::new)
}

/// Checkpoint files in `dir`, oldest cut first.
pub fn list_checkpoints(dir: &Path) -> CoreResult<Vec<(Lsn, PathBuf)>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(cut) = entry.file_name().to_str().and_then(parse_file_name) {
            found.push((cut, entry.path()));
        }
    }
    found.sort_by_key(|(cut, _)| *cut);
    Ok(found)
}

fn encode(db_id: DatabaseId, data: &CheckpointData) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    let record = |op: OpType, tx: TransactionId, collection: &str, doc_id: u64, payload: Vec<u8>| {
        WalRecord {
            lsn: data.cut,
            tx_id: tx,
            db_id,
            collection: collection.to_string(),
            op,
            doc_id,
            payload,
        }
    };

    record(
        OpType::Checkpoint,
        data.watermark,
        "",
        data.next_id,
        data.replay_from.as_u64().to_le_bytes().to_vec(),
    )
    .encode_into(&mut buf)?;
    for c in &data.collections {
        record(
            OpType::CreateCollection,
            c.created_tx,
            &c.name,
            0,
            c.created_at.to_le_bytes().to_vec(),
        )
        .encode_into(&mut buf)?;
    }
    for d in &data.documents {
        record(OpType::Create, d.created_tx, &d.collection, d.doc_id, d.payload.clone())
            .encode_into(&mut buf)?;
    }
    let entries = (data.collections.len() + data.documents.len()) as u64;
    record(
        OpType::Commit,
        data.watermark,
        "",
        entries,
        data.cut.as_u64().to_le_bytes().to_vec(),
    )
    .encode_into(&mut buf)?;
    Ok(buf)
}

/// Writes a checkpoint atomically (temp file, sync, rename, directory sync).
pub fn write_checkpoint(dir: &Path, db_id: DatabaseId, data: &CheckpointData) -> CoreResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let final_path = dir.join(checkpoint_file_name(data.cut));
    let temp_path = dir.join(format!("{}{TEMP_SUFFIX}", checkpoint_file_name(data.cut)));

    let bytes = encode(db_id, data)?;
    let mut file = FileBackend::open(&temp_path)?;
    file.truncate(0)?;
    file.append(&bytes)?;
    file.sync()?;
    drop(file);

    fs::rename(&temp_path, &final_path)?;
    sync_directory(dir)?;
    Ok(final_path)
}

fn le_u64(payload: &[u8], what: &str) -> CoreResult<u64> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| CoreError::corruption(format!("checkpoint {what} is not 8 bytes")))?;
    Ok(u64::from_le_bytes(bytes))
}

/// Reads and fully validates a checkpoint file.
///
/// # Errors
///
/// `Corruption` if any record fails its CRC, the trailer is missing, or the
/// entry count disagrees with the trailer.
pub fn read_checkpoint(path: &Path, db_id: DatabaseId) -> CoreResult<CheckpointData> {
    let backend = FileBackend::open(path)?;
    let scan = scan_segment(&backend)?;
    if let Some(stop) = scan.stop {
        return Err(CoreError::corruption(format!(
            "checkpoint {} is damaged at offset {}: {stop}",
            path.display(),
            scan.valid_len
        )));
    }

    let mut records = scan.records.into_iter();
    let header = records
        .next()
        .filter(|r| r.op == OpType::Checkpoint)
        .ok_or_else(|| CoreError::corruption(format!("checkpoint {} has no header", path.display())))?;
    if header.db_id != db_id {
        return Err(CoreError::corruption(format!(
            "checkpoint {} belongs to {}, expected {db_id}",
            path.display(),
            header.db_id
        )));
    }

    let mut data = CheckpointData {
        cut: header.lsn,
        replay_from: Lsn::new(le_u64(&header.payload, "header")?),
        watermark: header.tx_id,
        next_id: header.doc_id,
        collections: Vec::new(),
        documents: Vec::new(),
    };

    let mut trailer = None;
    for record in records {
        if trailer.is_some() {
            return Err(CoreError::corruption(format!(
                "checkpoint {} has records after its trailer",
                path.display()
            )));
        }
        match record.op {
            OpType::CreateCollection => data.collections.push(CheckpointCollection {
                created_at: le_u64(&record.payload, "collection timestamp")?,
                name: record.collection,
                created_tx: record.tx_id,
            }),
            OpType::Create => data.documents.push(CheckpointDocument {
                collection: record.collection,
                doc_id: record.doc_id,
                created_tx: record.tx_id,
                payload: record.payload,
            }),
            OpType::Commit => trailer = Some(record),
            other => {
                return Err(CoreError::corruption(format!(
                    "unexpected {other} record in checkpoint {}",
                    path.display()
                )))
            }
        }
    }

    let trailer = trailer.ok_or_else(|| {
        CoreError::corruption(format!("checkpoint {} has no trailer", path.display()))
    })?;
    let entries = (data.collections.len() + data.documents.len()) as u64;
    if trailer.doc_id != entries || le_u64(&trailer.payload, "trailer")? != data.cut.as_u64() {
        return Err(CoreError::corruption(format!(
            "checkpoint {} trailer does not match its contents",
            path.display()
        )));
    }
    Ok(data)
}

/// Loads the newest checkpoint that validates, skipping damaged ones.
pub fn load_latest(dir: &Path, db_id: DatabaseId) -> CoreResult<Option<CheckpointData>> {
    for (cut, path) in list_checkpoints(dir)?.into_iter().rev() {
        match read_checkpoint(&path, db_id) {
            Ok(data) => return Ok(Some(data)),
            Err(err) => {
                tracing::warn!(
                    db = %db_id,
                    cut = %cut,
                    error = %err,
                    "skipping unreadable checkpoint"
                );
            }
        }
    }
    Ok(None)
}

/// Reads only the `replay_from` field of a checkpoint header.
pub fn read_replay_from(path: &Path) -> CoreResult<Lsn> {
    let backend = FileBackend::open(path)?;
    let prefix = backend.read_at(0, crate::wal::LEN_PREFIX)?;
    let body_len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    let body = backend.read_at(crate::wal::LEN_PREFIX as u64, body_len)?;
    let header = WalRecord::decode_body(&body)?;
    Ok(Lsn::new(le_u64(&header.payload, "header")?))
}

/// Deletes all but the newest `keep` checkpoints and any stale temp files.
///
/// Returns the `(cut, path)` pairs that remain, oldest first.
pub fn prune_checkpoints(dir: &Path, keep: usize) -> CoreResult<Vec<(Lsn, PathBuf)>> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name
            .to_str()
            .is_some_and(|n| n.starts_with(PREFIX) && n.ends_with(TEMP_SUFFIX))
        {
            fs::remove_file(entry.path())?;
        }
    }

    let mut all = list_checkpoints(dir)?;
    let excess = all.len().saturating_sub(keep.max(1));
    for (cut, path) in all.drain(..excess) {
        fs::remove_file(&path)?;
        tracing::debug!(cut = %cut, "removed old checkpoint");
    }
    if excess > 0 {
        sync_directory(dir)?;
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DB: DatabaseId = DatabaseId(4);

    fn sample(cut: u64) -> CheckpointData {
        CheckpointData {
            cut: Lsn::new(cut),
            replay_from: Lsn::new(cut - 2),
            watermark: TransactionId::new(30),
            next_id: 31,
            collections: vec![
                CheckpointCollection {
                    name: "_default".into(),
                    created_tx: TransactionId::ZERO,
                    created_at: 0,
                },
                CheckpointCollection {
                    name: "users".into(),
                    created_tx: TransactionId::new(3),
                    created_at: 1_700_000_000_000,
                },
            ],
            documents: vec![CheckpointDocument {
                collection: "users".into(),
                doc_id: 9,
                created_tx: TransactionId::new(12),
                payload: b"{\"name\":\"ada\"}".to_vec(),
            }],
        }
    }

    #[test]
    fn write_then_read() {
        let dir = tempdir().unwrap();
        let path = write_checkpoint(dir.path(), DB, &sample(50)).unwrap();
        assert_eq!(path.file_name().unwrap(), "checkpoint-0000000000000032.ckpt");
        assert_eq!(read_checkpoint(&path, DB).unwrap(), sample(50));
        assert_eq!(read_replay_from(&path).unwrap(), Lsn::new(48));
    }

    #[test]
    fn damaged_newest_falls_back_to_older() {
        let dir = tempdir().unwrap();
        write_checkpoint(dir.path(), DB, &sample(10)).unwrap();
        let newest = write_checkpoint(dir.path(), DB, &sample(20)).unwrap();

        let mut bytes = fs::read(&newest).unwrap();
        let len = bytes.len();
        bytes.truncate(len - 3);
        fs::write(&newest, bytes).unwrap();

        let loaded = load_latest(dir.path(), DB).unwrap().unwrap();
        assert_eq!(loaded.cut, Lsn::new(10));
    }

    #[test]
    fn wrong_database_is_rejected() {
        let dir = tempdir().unwrap();
        let path = write_checkpoint(dir.path(), DB, &sample(10)).unwrap();
        assert!(read_checkpoint(&path, DatabaseId::new(5)).is_err());
    }

    #[test]
    fn prune_keeps_newest() {
        let dir = tempdir().unwrap();
        for cut in [10, 20, 30, 40] {
            write_checkpoint(dir.path(), DB, &sample(cut)).unwrap();
        }
        fs::write(dir.path().join("checkpoint-0000000000000099.ckpt.tmp"), b"partial").unwrap();

        let left = prune_checkpoints(dir.path(), 2).unwrap();
        let cuts: Vec<u64> = left.iter().map(|(cut, _)| cut.as_u64()).collect();
        assert_eq!(cuts, [30, 40]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn empty_directory_has_no_checkpoint() {
        let dir = tempdir().unwrap();
        assert!(load_latest(dir.path(), DB).unwrap().is_none());
        assert!(load_latest(&dir.path().join("missing"), DB).unwrap().is_none());
    }
}
