//! # Strata Testkit
//!
//! Test utilities for Strata.
//!
//! This crate provides:
//! - Engine fixtures on temporary data directories
//! - Property-based test generators using proptest
//! - Crash simulation by damaging WAL segments on disk
//! - Concurrent load helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strata_testkit::prelude::*;
//!
//! #[test]
//! fn survives_restart() {
//!     let mut env = TestEngine::new();
//!     let db = env.create_database("app");
//!     env.engine().execute(db, Request::create("_default", 1, b"x".to_vec())).unwrap();
//!     env.restart();
//!     // ...
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use strata_core::{
        Config, CoreError, DatabaseId, Engine, Expression, OrderSpec, Query, Request, Row,
    };
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
