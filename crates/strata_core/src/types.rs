//! Core identifier types.

use serde::Serialize;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a logical database.
///
/// Assigned by the catalog, monotonically increasing and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DatabaseId(pub u64);

impl DatabaseId {
    /// Creates a database ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db:{}", self.0)
    }
}

/// Transaction or commit identifier.
///
/// One counter per database issues both: a transaction draws an ID when it
/// begins and another when it commits. Versions are stamped with the commit
/// ID, and snapshots name the latest published commit ID.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// The ID below every issued ID; an empty database's snapshot.
    pub const ZERO: Self = Self(0);

    /// Creates a transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx:{}", self.0)
    }
}

/// Log sequence number.
///
/// Strictly increasing within one WAL; the first record gets 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Sentinel below every assigned LSN.
    pub const ZERO: Self = Self(0);

    /// Creates an LSN.
    #[must_use]
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The following LSN.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}

/// Document identifier, unique within a collection.
pub type DocumentId = u64;

/// A document as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Document ID.
    pub id: DocumentId,
    /// Opaque payload (JSON when queried by field).
    pub payload: Vec<u8>,
}

/// Name of the collection every database starts with.
pub const DEFAULT_COLLECTION: &str = "_default";

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_next_and_order() {
        let first = Lsn::new(1);
        assert_eq!(first.next().as_u64(), 2);
        assert!(Lsn::ZERO < first);
    }

    #[test]
    fn display_formats() {
        assert_eq!(DatabaseId::new(7).to_string(), "db:7");
        assert_eq!(TransactionId::new(3).to_string(), "tx:3");
        assert_eq!(Lsn::new(42).to_string(), "lsn:42");
    }
}
