//! Global and per-database memory accounting.
//!
//! Every payload byte the engine keeps in memory is charged to the owning
//! database. An allocation succeeds only if it fits under both the
//! database's limit and the global capacity; the two counters are advanced
//! with compare-exchange loops so neither ever reads above its limit.
//!
//! ## Replay budget
//!
//! While a database replays its WAL, allocations go to a separate replay
//! counter with its own budget. Replay bytes still count against the global
//! ceiling. When replay finishes, [`MemoryGovernor::merge_replay_usage`]
//! moves the replay bytes into the database's normal counter.

use crate::error::{CoreError, CoreResult, Missing};
use crate::types::DatabaseId;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug)]
struct Account {
    /// Zero means bounded only by the global capacity.
    limit: u64,
    used: AtomicU64,
}

#[derive(Debug)]
struct ReplayAccount {
    budget: u64,
    used: AtomicU64,
}

/// Usage of one registered database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DbMemoryUsage {
    /// Bytes charged in steady state.
    pub used: u64,
    /// Per-database limit (zero = none).
    pub limit: u64,
    /// Bytes charged while replaying, if replay is in progress.
    pub replay_used: Option<u64>,
    /// Replay budget, if replay is in progress.
    pub replay_budget: Option<u64>,
}

/// Snapshot of the governor's counters.
#[derive(Debug, Clone, Serialize)]
pub struct GovernorStats {
    /// Global capacity.
    pub capacity: u64,
    /// Global usage, steady state plus replay.
    pub used: u64,
    /// Registered databases.
    pub databases: usize,
    /// Rejected allocations since start.
    pub rejections: u64,
}

/// Enforces the global capacity and per-database limits.
#[derive(Debug)]
pub struct MemoryGovernor {
    capacity: u64,
    global_used: AtomicU64,
    rejections: AtomicU64,
    accounts: RwLock<HashMap<DatabaseId, Arc<Account>>>,
    replay: RwLock<HashMap<DatabaseId, Arc<ReplayAccount>>>,
}

/// Adds `size` to `counter` unless the result would exceed `limit`
/// (`limit == 0` disables the check).
fn reserve(counter: &AtomicU64, limit: u64, size: u64) -> bool {
    let mut current = counter.load(Ordering::Acquire);
    loop {
        let Some(next) = current.checked_add(size) else {
            return false;
        };
        if limit != 0 && next > limit {
            return false;
        }
        match counter.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

/// Subtracts up to `size` from `counter`, never below zero. Returns the
/// amount actually subtracted.
fn release(counter: &AtomicU64, size: u64) -> u64 {
    let previous = counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some(current.saturating_sub(size))
        })
        .unwrap_or(0);
    previous.min(size)
}

impl MemoryGovernor {
    /// Creates a governor with the given global capacity in bytes.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            global_used: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            accounts: RwLock::new(HashMap::new()),
            replay: RwLock::new(HashMap::new()),
        }
    }

    /// Global capacity.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current global usage.
    #[must_use]
    pub fn global_usage(&self) -> u64 {
        self.global_used.load(Ordering::Acquire)
    }

    /// Registers a database with a per-database limit (zero = none).
    ///
    /// Re-registering keeps the current usage and replaces the limit.
    pub fn register_db(&self, db: DatabaseId, limit: u64) {
        let mut accounts = self.accounts.write();
        let used = accounts
            .get(&db)
            .map(|account| account.used.load(Ordering::Acquire))
            .unwrap_or(0);
        accounts.insert(
            db,
            Arc::new(Account {
                limit,
                used: AtomicU64::new(used),
            }),
        );
        debug!(%db, limit, "registered database with memory governor");
    }

    /// Removes a database and returns all of its bytes to the global pool.
    pub fn unregister_db(&self, db: DatabaseId) {
        let account = self.accounts.write().remove(&db);
        let replay = self.replay.write().remove(&db);

        let mut returned = 0;
        if let Some(account) = account {
            returned += account.used.swap(0, Ordering::AcqRel);
        }
        if let Some(replay) = replay {
            returned += replay.used.swap(0, Ordering::AcqRel);
        }
        release(&self.global_used, returned);
        debug!(%db, returned, "unregistered database from memory governor");
    }

    fn account(&self, db: DatabaseId) -> Option<Arc<Account>> {
        self.accounts.read().get(&db).cloned()
    }

    fn replay_account(&self, db: DatabaseId) -> Option<Arc<ReplayAccount>> {
        self.replay.read().get(&db).cloned()
    }

    /// Charges `size` bytes to `db`.
    ///
    /// Fails without changing any counter if the database is not registered,
    /// or if the charge would push the database above its limit or the
    /// global usage above capacity.
    pub fn try_allocate(&self, db: DatabaseId, size: u64) -> bool {
        let Some(account) = self.account(db) else {
            return self.reject(db, size);
        };
        if !reserve(&account.used, account.limit, size) {
            return self.reject(db, size);
        }
        if !reserve(&self.global_used, self.capacity, size) {
            release(&account.used, size);
            return self.reject(db, size);
        }
        true
    }

    /// Like [`MemoryGovernor::try_allocate`] but returns
    /// [`CoreError::MemoryLimit`] on rejection.
    pub fn allocate(&self, db: DatabaseId, size: u64) -> CoreResult<()> {
        if self.try_allocate(db, size) {
            Ok(())
        } else {
            Err(CoreError::MemoryLimit {
                db,
                requested: size,
            })
        }
    }

    fn reject(&self, db: DatabaseId, size: u64) -> bool {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        warn!(%db, size, "memory allocation rejected");
        false
    }

    /// Whether `size` bytes would currently fit for `db`.
    ///
    /// Advisory only: a concurrent allocation may take the room before the
    /// caller acts on the answer.
    #[must_use]
    pub fn can_allocate(&self, db: DatabaseId, size: u64) -> bool {
        let Some(account) = self.account(db) else {
            return false;
        };
        let used = account.used.load(Ordering::Acquire);
        let fits_db = account.limit == 0 || used.saturating_add(size) <= account.limit;
        let fits_global = self.global_usage().saturating_add(size) <= self.capacity;
        fits_db && fits_global
    }

    /// Returns `size` bytes charged to `db`. Over-reporting is clamped.
    pub fn free(&self, db: DatabaseId, size: u64) {
        let Some(account) = self.account(db) else {
            return;
        };
        let freed = release(&account.used, size);
        release(&self.global_used, freed);
    }

    /// Starts replay accounting for `db`.
    ///
    /// The budget is `budget` if non-zero, else `fallback` if non-zero, else
    /// 10% of the global capacity; it never exceeds the database's own limit.
    /// Returns the effective budget.
    pub fn set_replay_budget(&self, db: DatabaseId, budget: u64, fallback: u64) -> CoreResult<u64> {
        let account = self
            .account(db)
            .ok_or_else(|| CoreError::not_found(Missing::Database, db))?;

        let mut effective = if budget > 0 {
            budget
        } else if fallback > 0 {
            fallback
        } else {
            self.capacity / 10
        };
        if account.limit > 0 {
            effective = effective.min(account.limit);
        }

        self.replay.write().insert(
            db,
            Arc::new(ReplayAccount {
                budget: effective,
                used: AtomicU64::new(0),
            }),
        );
        Ok(effective)
    }

    /// Charges `size` bytes to `db`'s replay budget (and the global ceiling).
    pub fn try_allocate_replay(&self, db: DatabaseId, size: u64) -> bool {
        let Some(replay) = self.replay_account(db) else {
            return self.reject(db, size);
        };
        if !reserve(&replay.used, replay.budget, size) {
            return self.reject(db, size);
        }
        if !reserve(&self.global_used, self.capacity, size) {
            release(&replay.used, size);
            return self.reject(db, size);
        }
        true
    }

    /// Returns replay bytes, e.g. for versions dropped during replay.
    pub fn free_replay(&self, db: DatabaseId, size: u64) {
        if let Some(replay) = self.replay_account(db) {
            let freed = release(&replay.used, size);
            release(&self.global_used, freed);
        }
    }

    /// Folds the replay counter into the normal counter and ends replay
    /// accounting. Returns the merged byte count.
    pub fn merge_replay_usage(&self, db: DatabaseId) -> u64 {
        let Some(replay) = self.replay.write().remove(&db) else {
            return 0;
        };
        let bytes = replay.used.swap(0, Ordering::AcqRel);
        match self.account(db) {
            Some(account) => {
                account.used.fetch_add(bytes, Ordering::AcqRel);
            }
            None => {
                release(&self.global_used, bytes);
            }
        }
        debug!(%db, bytes, "merged replay usage");
        bytes
    }

    /// Usage of one database, if registered.
    #[must_use]
    pub fn usage(&self, db: DatabaseId) -> Option<DbMemoryUsage> {
        let account = self.account(db)?;
        let replay = self.replay_account(db);
        Some(DbMemoryUsage {
            used: account.used.load(Ordering::Acquire),
            limit: account.limit,
            replay_used: replay.as_ref().map(|r| r.used.load(Ordering::Acquire)),
            replay_budget: replay.as_ref().map(|r| r.budget),
        })
    }

    /// Snapshot of the global counters.
    #[must_use]
    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            capacity: self.capacity,
            used: self.global_usage(),
            databases: self.accounts.read().len(),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    const DB1: DatabaseId = DatabaseId(1);
    const DB2: DatabaseId = DatabaseId(2);

    #[test]
    fn allocate_within_limits() {
        let gov = MemoryGovernor::new(1000);
        gov.register_db(DB1, 400);

        assert!(gov.try_allocate(DB1, 300));
        assert!(!gov.try_allocate(DB1, 200));
        assert_eq!(gov.usage(DB1).unwrap().used, 300);
        assert_eq!(gov.global_usage(), 300);
    }

    #[test]
    fn global_capacity_binds_across_databases() {
        let gov = MemoryGovernor::new(500);
        gov.register_db(DB1, 0);
        gov.register_db(DB2, 0);

        assert!(gov.try_allocate(DB1, 400));
        assert!(!gov.try_allocate(DB2, 200));
        // A rejection leaves the per-db counter where it was.
        assert_eq!(gov.usage(DB2).unwrap().used, 0);
        assert_eq!(gov.stats().rejections, 1);
    }

    #[test]
    fn unregistered_database_is_rejected() {
        let gov = MemoryGovernor::new(500);
        assert!(!gov.try_allocate(DB1, 1));
        assert!(!gov.can_allocate(DB1, 1));
        assert!(matches!(
            gov.allocate(DB1, 1),
            Err(CoreError::MemoryLimit { .. })
        ));
    }

    #[test]
    fn free_clamps_at_zero() {
        let gov = MemoryGovernor::new(1000);
        gov.register_db(DB1, 0);
        gov.register_db(DB2, 0);
        assert!(gov.try_allocate(DB1, 100));
        assert!(gov.try_allocate(DB2, 50));

        gov.free(DB1, 10_000);
        assert_eq!(gov.usage(DB1).unwrap().used, 0);
        // DB2's bytes are still accounted globally.
        assert_eq!(gov.global_usage(), 50);
    }

    #[test]
    fn unregister_returns_bytes() {
        let gov = MemoryGovernor::new(1000);
        gov.register_db(DB1, 0);
        assert!(gov.try_allocate(DB1, 600));
        gov.unregister_db(DB1);
        assert_eq!(gov.global_usage(), 0);
        assert!(gov.usage(DB1).is_none());
    }

    #[test]
    fn replay_budget_defaults() {
        let gov = MemoryGovernor::new(1000);
        gov.register_db(DB1, 0);
        gov.register_db(DB2, 300);

        assert_eq!(gov.set_replay_budget(DB1, 0, 0).unwrap(), 100);
        assert_eq!(gov.set_replay_budget(DB1, 0, 250).unwrap(), 250);
        assert_eq!(gov.set_replay_budget(DB2, 500, 0).unwrap(), 300);
        assert!(gov.set_replay_budget(DatabaseId(9), 10, 0).is_err());
    }

    #[test]
    fn replay_usage_counts_globally_and_merges() {
        let gov = MemoryGovernor::new(1000);
        gov.register_db(DB1, 500);
        gov.register_db(DB2, 0);
        gov.set_replay_budget(DB1, 200, 0).unwrap();

        assert!(gov.try_allocate_replay(DB1, 150));
        assert!(!gov.try_allocate_replay(DB1, 100));
        assert_eq!(gov.global_usage(), 150);
        assert_eq!(gov.usage(DB1).unwrap().replay_used, Some(150));

        assert!(gov.try_allocate(DB2, 850));
        assert!(!gov.try_allocate_replay(DB1, 10));

        assert_eq!(gov.merge_replay_usage(DB1), 150);
        let usage = gov.usage(DB1).unwrap();
        assert_eq!(usage.used, 150);
        assert_eq!(usage.replay_used, None);
        assert_eq!(gov.global_usage(), 1000);
        assert!(!gov.try_allocate_replay(DB1, 1));
    }

    #[test]
    fn concurrent_allocations_never_exceed_limits() {
        let gov = Arc::new(MemoryGovernor::new(10_000));
        gov.register_db(DB1, 6_000);
        gov.register_db(DB2, 6_000);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let gov = Arc::clone(&gov);
                let db = if i % 2 == 0 { DB1 } else { DB2 };
                thread::spawn(move || {
                    let mut granted = 0u64;
                    for _ in 0..1_000 {
                        if gov.try_allocate(db, 7) {
                            granted += 7;
                        }
                        assert!(gov.global_usage() <= 10_000);
                    }
                    granted
                })
            })
            .collect();
        let granted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(granted, gov.global_usage());
        assert!(gov.usage(DB1).unwrap().used <= 6_000);
        assert!(gov.usage(DB2).unwrap().used <= 6_000);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc(bool, u64),
        Free(bool, u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<bool>(), 0u64..400).prop_map(|(d, n)| Op::Alloc(d, n)),
            (any::<bool>(), 0u64..400).prop_map(|(d, n)| Op::Free(d, n)),
        ]
    }

    proptest! {
        #[test]
        fn caps_hold_for_any_sequence(ops in proptest::collection::vec(op_strategy(), 1..200)) {
            let gov = MemoryGovernor::new(1_000);
            gov.register_db(DB1, 600);
            gov.register_db(DB2, 700);

            for op in ops {
                match op {
                    Op::Alloc(first, size) => {
                        let db = if first { DB1 } else { DB2 };
                        let before_db = gov.usage(db).unwrap().used;
                        let before_global = gov.global_usage();
                        if !gov.try_allocate(db, size) {
                            prop_assert_eq!(gov.usage(db).unwrap().used, before_db);
                            prop_assert_eq!(gov.global_usage(), before_global);
                        }
                    }
                    Op::Free(first, size) => gov.free(if first { DB1 } else { DB2 }, size),
                }
                let u1 = gov.usage(DB1).unwrap().used;
                let u2 = gov.usage(DB2).unwrap().used;
                prop_assert!(u1 <= 600);
                prop_assert!(u2 <= 700);
                prop_assert!(gov.global_usage() <= 1_000);
                prop_assert_eq!(gov.global_usage(), u1 + u2);
            }
        }
    }
}
