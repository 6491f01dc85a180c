//! Load helpers for concurrency tests.
//!
//! These drive an engine from many client threads through its schedulers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use strata_core::{CoreError, DatabaseId, Engine, Query, Request};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Operations rejected with `Conflict`.
    pub conflicts: usize,
    /// Operations that failed for any other reason.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, conflicts: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + conflicts + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            conflicts,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Conflicts: {}", self.conflicts);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Client threads.
    pub threads: usize,
    /// Operations per thread.
    pub ops_per_thread: usize,
    /// Payload size in bytes.
    pub payload_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 10,
            ops_per_thread: 100,
            payload_size: 64,
        }
    }
}

#[derive(Default)]
struct Counters {
    ok: AtomicUsize,
    conflicts: AtomicUsize,
    failed: AtomicUsize,
}

impl Counters {
    fn record<T>(&self, result: &Result<T, CoreError>) {
        let counter = match result {
            Ok(_) => &self.ok,
            Err(CoreError::Conflict { .. }) => &self.conflicts,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn finish(&self, start: Instant) -> StressTestResult {
        StressTestResult::new(
            self.ok.load(Ordering::Relaxed),
            self.conflicts.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            start.elapsed(),
        )
    }
}

fn run_clients<F>(config: &StressConfig, op: F) -> StressTestResult
where
    F: Fn(usize, usize) -> Result<(), CoreError> + Sync,
{
    let counters = Counters::default();
    let start = Instant::now();
    thread::scope(|scope| {
        for t in 0..config.threads {
            let counters = &counters;
            let op = &op;
            let ops = config.ops_per_thread;
            scope.spawn(move || {
                for i in 0..ops {
                    counters.record(&op(t, i));
                }
            });
        }
    });
    counters.finish(start)
}

/// Each thread creates its own documents: thread `t` writes IDs
/// `t * ops_per_thread + i`. No two requests touch the same document.
pub fn stress_concurrent_creates(engine: &Engine, db: DatabaseId, config: &StressConfig) -> StressTestResult {
    let payload = vec![0xAB; config.payload_size];
    run_clients(config, |t, i| {
        let id = (t * config.ops_per_thread + i) as u64;
        engine
            .execute(db, Request::create("_default", id, payload.clone()))
            .map(drop)
    })
}

/// Every thread updates the same `hot_docs` documents round-robin.
///
/// The documents must exist. In multi-worker mode some updates conflict.
pub fn stress_hot_updates(
    engine: &Engine,
    db: DatabaseId,
    hot_docs: u64,
    config: &StressConfig,
) -> StressTestResult {
    run_clients(config, |t, i| {
        let id = (i as u64) % hot_docs.max(1);
        let payload = format!(r#"{{"thread":{t},"op":{i}}}"#).into_bytes();
        engine
            .execute(db, Request::update("_default", id, payload))
            .map(drop)
    })
}

/// Readers scan the collection while one writer keeps inserting.
///
/// Returns the number of scans whose row count decreased relative to an
/// earlier scan by the same reader; snapshot reads keep this at zero.
pub fn stress_readers_during_writes(
    engine: &Engine,
    db: DatabaseId,
    readers: usize,
    writes: u64,
) -> usize {
    let regressions = AtomicUsize::new(0);
    let done = AtomicBool::new(false);
    thread::scope(|scope| {
        for _ in 0..readers {
            scope.spawn(|| {
                let mut last = 0;
                while !done.load(Ordering::Acquire) {
                    let Ok(stream) = engine.query(db, "_default", &Query::new()) else {
                        continue;
                    };
                    let count = stream.filter(Result::is_ok).count();
                    if count < last {
                        regressions.fetch_add(1, Ordering::Relaxed);
                    }
                    last = count;
                }
            });
        }
        for id in 0..writes {
            let _ = engine.execute(db, Request::create("_default", id, b"{}".to_vec()));
        }
        done.store(true, Ordering::Release);
    });
    regressions.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestEngine;

    #[test]
    fn small_concurrent_create_run() {
        let env = TestEngine::new();
        let db = env.create_database("stress");
        let config = StressConfig {
            threads: 3,
            ops_per_thread: 10,
            payload_size: 8,
        };
        let result = stress_concurrent_creates(&env, db, &config);
        assert_eq!(result.successful_ops, 30);
        assert_eq!(result.failed_ops, 0);
    }
}
