//! WAL dump for debugging.

use super::{ensure_data_dir, CliError, Format};
use serde::Serialize;
use std::path::Path;
use strata_core::dir::wal_path;
use strata_core::wal::{Wal, WalRecord};
use strata_core::{DatabaseId, OpType};

/// One WAL record as printed.
#[derive(Debug, Serialize)]
pub struct WalRecordInfo {
    /// Log sequence number.
    pub lsn: u64,
    /// Transaction that wrote the record.
    pub tx_id: u64,
    /// Operation.
    pub op: OpType,
    /// Collection, empty for markers.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub collection: String,
    /// Document ID, or the marker's auxiliary value.
    pub doc_id: u64,
    /// Payload size in bytes.
    pub payload_size: usize,
    /// Commit ID or checkpoint cut carried by a marker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<u64>,
}

impl From<&WalRecord> for WalRecordInfo {
    fn from(record: &WalRecord) -> Self {
        let marker = match record.op {
            OpType::Commit | OpType::Checkpoint => record.marker_value().ok(),
            _ => None,
        };
        Self {
            lsn: record.lsn.as_u64(),
            tx_id: record.tx_id.as_u64(),
            op: record.op,
            collection: record.collection.clone(),
            doc_id: record.doc_id,
            payload_size: record.payload.len(),
            marker,
        }
    }
}

/// Records of database `db`, up to `limit`, and whether the tail was torn.
pub fn records(
    path: &Path,
    db: DatabaseId,
    limit: Option<usize>,
) -> Result<(Vec<WalRecordInfo>, bool), CliError> {
    ensure_data_dir(path)?;
    let replay = Wal::read_dir(&wal_path(path, db), db)?;
    let records = replay
        .records
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(WalRecordInfo::from)
        .collect();
    Ok((records, replay.torn_tail))
}

/// Runs the dump-wal command.
pub fn run(path: &Path, db: u64, limit: Option<usize>, format: Format) -> Result<(), CliError> {
    let (records, torn_tail) = records(path, DatabaseId::new(db), limit)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        Format::Text => print_text_output(&records, torn_tail),
    }
    Ok(())
}

fn print_text_output(records: &[WalRecordInfo], torn_tail: bool) {
    println!("WAL Records ({} shown)", records.len());
    println!("================");
    println!();

    for record in records {
        print!("[{:08}] {:<18} tx={}", record.lsn, record.op.as_str(), record.tx_id);
        if let Some(marker) = record.marker {
            print!(" value={marker}");
        } else {
            if !record.collection.is_empty() {
                print!(" collection={}", record.collection);
            }
            print!(" doc={} payload={} bytes", record.doc_id, record.payload_size);
        }
        println!();
    }

    if torn_tail {
        println!();
        println!("(torn final record ignored)");
    }
}
