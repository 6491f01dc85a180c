//! Multi-version concurrency control.
//!
//! Every committed write creates a [`DocumentVersion`] stamped with the
//! commit ID; deletes and replacements stamp the previous version's
//! `deleted_tx`. A reader at snapshot `S` sees exactly the versions with
//! `created_tx <= S < deleted_tx`. Write-write conflicts are resolved
//! first-committer-wins when a transaction commits.

mod index;
mod manager;
mod transaction;
mod version;

pub use index::{CollectionMetadata, CompactionReport, VersionEntry, VersionIndex};
pub use manager::{Snapshot, TransactionManager};
pub use transaction::{Transaction, TransactionState, WriteOp, WriteSet};
pub use version::{visible, DocumentVersion};
