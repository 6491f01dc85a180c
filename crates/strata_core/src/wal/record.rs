//! WAL record types and serialization.

use crate::error::{CoreError, CoreResult};
use crate::types::{DatabaseId, DocumentId, Lsn, TransactionId};
use serde::Serialize;
use std::fmt;

/// Size of the length prefix in front of every record body.
pub const LEN_PREFIX: usize = 4;

/// Fixed part of a record body:
/// lsn(8) tx_id(8) db_id(8) op(1) doc_id(8) coll_len(2) payload_len(4) crc(4).
pub const FIXED_BODY_LEN: usize = 8 + 8 + 8 + 1 + 8 + 2 + 4 + 4;

/// Largest body a reader accepts; anything above is a damaged length field.
pub const MAX_BODY_LEN: usize = 256 * 1024 * 1024;

/// Largest collection name a record can carry.
pub const MAX_COLLECTION_LEN: usize = u16::MAX as usize;

/// Kind of operation a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OpType {
    /// Insert a new document.
    Create = 1,
    /// Read a document. Requests carry it; the WAL never does.
    Read = 2,
    /// Replace a document's payload.
    Update = 3,
    /// Tombstone a document.
    Delete = 4,
    /// Commit marker; payload is the commit ID.
    Commit = 5,
    /// Checkpoint marker; payload is the checkpoint's cut LSN.
    Checkpoint = 6,
    /// Merge-patch a document; payload is the merged result.
    Patch = 7,
    /// Create a collection.
    CreateCollection = 8,
    /// Drop a collection.
    DeleteCollection = 9,
}

impl OpType {
    /// Converts a byte to an op type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Create),
            2 => Some(Self::Read),
            3 => Some(Self::Update),
            4 => Some(Self::Delete),
            5 => Some(Self::Commit),
            6 => Some(Self::Checkpoint),
            7 => Some(Self::Patch),
            8 => Some(Self::CreateCollection),
            9 => Some(Self::DeleteCollection),
            _ => None,
        }
    }

    /// Converts the op type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether applying this op changes a document.
    #[must_use]
    pub const fn is_document_mutation(self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Delete | Self::Patch)
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Commit => "commit",
            Self::Checkpoint => "checkpoint",
            Self::Patch => "patch",
            Self::CreateCollection => "create_collection",
            Self::DeleteCollection => "delete_collection",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One WAL record.
///
/// The on-disk frame is `body_len(4,LE) | body`, and the body ends with a
/// CRC32 over everything before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalRecord {
    /// Position in the log; assigned by [`crate::wal::Wal::append`].
    pub lsn: Lsn,
    /// Transaction the record belongs to.
    pub tx_id: TransactionId,
    /// Owning database.
    pub db_id: DatabaseId,
    /// Collection name (empty for markers).
    pub collection: String,
    /// Operation.
    pub op: OpType,
    /// Target document (zero for markers).
    pub doc_id: DocumentId,
    /// Operation payload.
    #[serde(skip)]
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// A document mutation record; the LSN is filled in on append.
    #[must_use]
    pub fn document(
        db_id: DatabaseId,
        tx_id: TransactionId,
        op: OpType,
        collection: &str,
        doc_id: DocumentId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            lsn: Lsn::ZERO,
            tx_id,
            db_id,
            collection: collection.to_string(),
            op,
            doc_id,
            payload,
        }
    }

    /// A commit marker carrying the commit ID.
    #[must_use]
    pub fn commit(db_id: DatabaseId, tx_id: TransactionId, commit_id: TransactionId) -> Self {
        Self {
            lsn: Lsn::ZERO,
            tx_id,
            db_id,
            collection: String::new(),
            op: OpType::Commit,
            doc_id: 0,
            payload: commit_id.as_u64().to_le_bytes().to_vec(),
        }
    }

    /// A checkpoint marker naming the checkpoint's cut LSN.
    #[must_use]
    pub fn checkpoint(db_id: DatabaseId, cut: Lsn) -> Self {
        Self {
            lsn: Lsn::ZERO,
            tx_id: TransactionId::ZERO,
            db_id,
            collection: String::new(),
            op: OpType::Checkpoint,
            doc_id: 0,
            payload: cut.as_u64().to_le_bytes().to_vec(),
        }
    }

    /// Length of the body (without the length prefix).
    #[must_use]
    pub fn body_len(&self) -> usize {
        FIXED_BODY_LEN + self.collection.len() + self.payload.len()
    }

    /// Length of the full frame.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        LEN_PREFIX + self.body_len()
    }

    /// Reads the 8-byte ID carried by `Commit` and `Checkpoint` markers.
    pub fn marker_value(&self) -> CoreResult<u64> {
        let bytes: [u8; 8] = self.payload.as_slice().try_into().map_err(|_| {
            CoreError::corruption(format!(
                "{} record at {} has a {}-byte payload, expected 8",
                self.op,
                self.lsn,
                self.payload.len()
            ))
        })?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Appends the full frame to `buf`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the collection name or payload cannot be
    /// represented in the frame.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> CoreResult<()> {
        if self.collection.len() > MAX_COLLECTION_LEN {
            return Err(CoreError::invalid_argument(format!(
                "collection name of {} bytes exceeds {MAX_COLLECTION_LEN}",
                self.collection.len()
            )));
        }
        let body_len = self.body_len();
        if body_len > MAX_BODY_LEN {
            return Err(CoreError::invalid_argument(format!(
                "WAL record of {body_len} bytes exceeds {MAX_BODY_LEN}"
            )));
        }

        buf.reserve(LEN_PREFIX + body_len);
        buf.extend_from_slice(&(body_len as u32).to_le_bytes());
        let body_start = buf.len();
        buf.extend_from_slice(&self.lsn.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.tx_id.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.db_id.as_u64().to_le_bytes());
        buf.push(self.op.as_byte());
        buf.extend_from_slice(&self.doc_id.to_le_bytes());
        buf.extend_from_slice(&(self.collection.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.collection.as_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = crc32fast::hash(&buf[body_start..]);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Encodes the full frame into a new vector.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.frame_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a record body (the bytes after the length prefix).
    ///
    /// # Errors
    ///
    /// Returns `Corruption` on a CRC mismatch, an unknown op byte, inner
    /// lengths that disagree with the body length, or a non-UTF-8 name.
    pub fn decode_body(body: &[u8]) -> CoreResult<Self> {
        if body.len() < FIXED_BODY_LEN {
            return Err(CoreError::corruption(format!(
                "record body of {} bytes is shorter than the fixed header",
                body.len()
            )));
        }

        let (content, crc_bytes) = body.split_at(body.len() - 4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let computed = crc32fast::hash(content);
        if stored != computed {
            return Err(CoreError::corruption(format!(
                "checksum mismatch: stored {stored:08x}, computed {computed:08x}"
            )));
        }

        let mut cursor = Cursor::new(content);
        let lsn = Lsn::new(cursor.u64()?);
        let tx_id = TransactionId::new(cursor.u64()?);
        let db_id = DatabaseId::new(cursor.u64()?);
        let op_byte = cursor.u8()?;
        let op = OpType::from_byte(op_byte)
            .ok_or_else(|| CoreError::corruption(format!("unknown op type {op_byte} at {lsn}")))?;
        let doc_id = cursor.u64()?;
        let coll_len = cursor.u16()? as usize;
        let collection = String::from_utf8(cursor.take(coll_len)?.to_vec())
            .map_err(|_| CoreError::corruption(format!("collection name at {lsn} is not UTF-8")))?;
        let payload_len = cursor.u32()? as usize;
        let payload = cursor.take(payload_len)?.to_vec();
        if !cursor.is_empty() {
            return Err(CoreError::corruption(format!(
                "{} trailing bytes in record at {lsn}",
                cursor.remaining()
            )));
        }

        Ok(Self {
            lsn,
            tx_id,
            db_id,
            collection,
            op,
            doc_id,
            payload,
        })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| CoreError::corruption("record field runs past the record body"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}
