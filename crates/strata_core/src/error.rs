//! Error types for the Strata core.

use crate::types::{DatabaseId, DocumentId};
use serde::Serialize;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// What a [`CoreError::NotFound`] was looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    /// A logical database.
    Database,
    /// A collection inside a database.
    Collection,
    /// A document inside a collection.
    Document,
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Database => "database",
            Self::Collection => "collection",
            Self::Document => "document",
        })
    }
}

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database, collection or document absent.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Kind of object.
        kind: Missing,
        /// Name or ID that was looked up.
        name: String,
    },

    /// Duplicate name or document.
    #[error("already exists: {name}")]
    AlreadyExists {
        /// The conflicting name or ID.
        name: String,
    },

    /// Write-write conflict under first-committer-wins.
    #[error("write conflict on document {doc_id} in collection {collection}")]
    Conflict {
        /// Collection of the contested document.
        collection: String,
        /// The contested document.
        doc_id: DocumentId,
    },

    /// The memory governor rejected an allocation.
    #[error("memory limit reached for {db}: {requested} bytes rejected")]
    MemoryLimit {
        /// Database that asked.
        db: DatabaseId,
        /// Size of the rejected allocation.
        requested: u64,
    },

    /// CRC, length or structural failure in the WAL, a checkpoint or the catalog.
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the damage.
        message: String,
    },

    /// Bad name, malformed query or invalid configuration.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// I/O failure on a file operation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(#[from] strata_storage::StorageError),

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Why the operation is invalid.
        message: String,
    },

    /// The request did not complete before its deadline.
    #[error("request timed out")]
    Timeout,

    /// The database (or engine) was closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Another process holds the data directory.
    #[error("data directory locked: another process has exclusive access")]
    DatabaseLocked,
}

/// Coarse error classes, used for statistics and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// See [`CoreError::NotFound`].
    NotFound,
    /// See [`CoreError::AlreadyExists`].
    AlreadyExists,
    /// See [`CoreError::Conflict`].
    Conflict,
    /// See [`CoreError::MemoryLimit`].
    MemoryLimit,
    /// See [`CoreError::Corruption`].
    Corruption,
    /// Bad input or invalid state transition.
    InvalidArgument,
    /// I/O, storage, closed, locked or timed out.
    Internal,
}

impl ErrorCategory {
    /// Every category, in a stable order.
    pub const ALL: [Self; 7] = [
        Self::NotFound,
        Self::AlreadyExists,
        Self::Conflict,
        Self::MemoryLimit,
        Self::Corruption,
        Self::InvalidArgument,
        Self::Internal,
    ];

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::Conflict => "conflict",
            Self::MemoryLimit => "memory_limit",
            Self::Corruption => "corruption",
            Self::InvalidArgument => "invalid_argument",
            Self::Internal => "internal",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl CoreError {
    /// Creates a not-found error.
    pub fn not_found(kind: Missing, name: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    /// Creates an already-exists error.
    pub fn already_exists(name: impl fmt::Display) -> Self {
        Self::AlreadyExists {
            name: name.to_string(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(collection: impl Into<String>, doc_id: DocumentId) -> Self {
        Self::Conflict {
            collection: collection.into(),
            doc_id,
        }
    }

    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::AlreadyExists { .. } => ErrorCategory::AlreadyExists,
            Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::MemoryLimit { .. } => ErrorCategory::MemoryLimit,
            Self::Corruption { .. } => ErrorCategory::Corruption,
            Self::InvalidArgument { .. } | Self::InvalidOperation { .. } => {
                ErrorCategory::InvalidArgument
            }
            Self::Io(_)
            | Self::Storage(_)
            | Self::Timeout
            | Self::DatabaseClosed
            | Self::DatabaseLocked => ErrorCategory::Internal,
        }
    }

    /// Whether the caller can carry on after this error.
    ///
    /// Only corruption needs manual intervention.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.category() != ErrorCategory::Corruption
    }
}
