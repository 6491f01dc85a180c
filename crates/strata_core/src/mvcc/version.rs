//! Document versions and the visibility rule.

use crate::types::{DocumentId, TransactionId};

/// One version of a document.
///
/// `created_tx` and `deleted_tx` are commit IDs. The payload lives in the
/// owning index's heap at `offset..offset + length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentVersion {
    /// Document the version belongs to.
    pub doc_id: DocumentId,
    /// Commit that created the version.
    pub created_tx: TransactionId,
    /// Commit that deleted or superseded it.
    pub deleted_tx: Option<TransactionId>,
    /// Payload offset in the heap.
    pub offset: usize,
    /// Payload length.
    pub length: usize,
}

impl DocumentVersion {
    /// Whether no commit has deleted or replaced this version.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.deleted_tx.is_none()
    }
}

/// `created_tx <= snapshot` and (`deleted_tx` absent or `> snapshot`).
#[must_use]
pub fn visible(version: &DocumentVersion, snapshot: TransactionId) -> bool {
    version.created_tx <= snapshot && version.deleted_tx.map_or(true, |d| d > snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(created: u64, deleted: Option<u64>) -> DocumentVersion {
        DocumentVersion {
            doc_id: 1,
            created_tx: TransactionId::new(created),
            deleted_tx: deleted.map(TransactionId::new),
            offset: 0,
            length: 0,
        }
    }

    #[test]
    fn created_after_snapshot_is_invisible() {
        let v = version(5, None);
        assert!(!visible(&v, TransactionId::new(4)));
        assert!(visible(&v, TransactionId::new(5)));
        assert!(visible(&v, TransactionId::new(100)));
    }

    #[test]
    fn deleted_at_or_before_snapshot_is_invisible() {
        let v = version(5, Some(9));
        assert!(visible(&v, TransactionId::new(8)));
        assert!(!visible(&v, TransactionId::new(9)));
        assert!(!visible(&v, TransactionId::new(10)));
        assert!(!v.is_live());
    }
}
