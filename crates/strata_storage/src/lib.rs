//! # Strata Storage
//!
//! Byte-store backends underneath the Strata engine.
//!
//! A backend is an append-only byte sequence with positional reads. It knows
//! nothing about catalog records or WAL framing; `strata_core` owns every
//! on-disk format and only asks a backend to append, read back, flush, sync
//! and cut a torn tail off.
//!
//! - [`FileBackend`] - one OS file per backend (catalog file, WAL segment)
//! - [`InMemoryBackend`] - tests, including injected write failures
//!
//! ```rust
//! use strata_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"segment bytes").unwrap();
//! assert_eq!(backend.read_at(offset, 7).unwrap(), b"segment");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
