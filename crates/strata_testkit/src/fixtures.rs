//! Test fixtures and engine helpers.
//!
//! Provides an engine on a temporary data directory that can be restarted
//! in place, plus helpers for common data sets.

use std::path::Path;
use std::time::Duration;
use strata_core::{Config, DatabaseId, Engine, Request};
use tempfile::TempDir;

/// Configuration used by fixtures: no fsync, no background maintenance.
#[must_use]
pub fn test_config(dir: &Path) -> Config {
    Config::new(dir)
        .sync_on_commit(false)
        .maintenance_interval(Duration::ZERO)
}

/// An engine on a temporary directory with automatic cleanup.
pub struct TestEngine {
    engine: Option<Engine>,
    config: Config,
    dir: TempDir,
}

impl TestEngine {
    /// Opens an engine with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Opens an engine with a customized [`test_config`].
    pub fn with_config(customize: impl FnOnce(Config) -> Config) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let config = customize(test_config(dir.path()));
        let engine = Engine::open(config.clone()).expect("Failed to open engine");
        Self {
            engine: Some(engine),
            config,
            dir,
        }
    }

    /// The running engine.
    pub fn engine(&self) -> &Engine {
        self.engine.as_ref().expect("Engine is stopped")
    }

    /// The data directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The configuration the engine runs with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers a database.
    pub fn create_database(&self, name: &str) -> DatabaseId {
        self.engine()
            .create_database(name)
            .expect("Failed to create database")
    }

    /// Shuts the engine down cleanly, leaving the directory in place.
    pub fn stop(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.shutdown().expect("Failed to shut down engine");
        }
    }

    /// Drops the engine without a clean shutdown path beyond `Drop`.
    ///
    /// Databases are still closed by `Drop`, so this is only a "crash" with
    /// respect to in-flight transactions; pair it with [`crate::crash`]
    /// helpers to damage the files afterwards.
    pub fn kill(&mut self) {
        self.engine.take();
    }

    /// Stops the engine and opens a new one on the same directory.
    pub fn restart(&mut self) {
        self.stop();
        self.start();
    }

    /// Opens the engine again after [`TestEngine::stop`] or [`TestEngine::kill`].
    pub fn start(&mut self) {
        assert!(self.engine.is_none(), "Engine is already running");
        self.engine = Some(self.try_start().expect("Failed to reopen engine"));
    }

    /// Opens a second engine on the directory, returning the error if any.
    pub fn try_start(&self) -> strata_core::CoreResult<Engine> {
        Engine::open(self.config.clone())
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        self.engine()
    }
}

/// Runs a test with a temporary engine.
pub fn with_temp_engine<F, R>(f: F) -> R
where
    F: FnOnce(&Engine) -> R,
{
    let env = TestEngine::new();
    f(env.engine())
}

/// JSON payload `{"index": i, "group": i % 3}`.
#[must_use]
pub fn json_doc(index: u64) -> Vec<u8> {
    format!(r#"{{"index":{},"group":{}}}"#, index, index % 3).into_bytes()
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates database `name` holding `count` documents in `_default`.
    pub fn populated_database(engine: &Engine, name: &str, count: u64) -> DatabaseId {
        let db = engine
            .create_database(name)
            .expect("Failed to create database");
        for i in 0..count {
            engine
                .execute(db, Request::create("_default", i, json_doc(i)))
                .expect("Failed to create document");
        }
        db
    }

    /// Creates `collections` collections in `db`, each with one document.
    pub fn multi_collection_database(engine: &Engine, db: DatabaseId, collections: usize) -> Vec<String> {
        (0..collections)
            .map(|i| {
                let name = format!("collection_{i}");
                engine
                    .execute(db, Request::create_collection(name.clone()))
                    .expect("Failed to create collection");
                engine
                    .execute(db, Request::create(name.clone(), 1, json_doc(i as u64)))
                    .expect("Failed to create document");
                name
            })
            .collect()
    }
}
