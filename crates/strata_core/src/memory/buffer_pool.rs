//! Size-tiered pool of reusable byte buffers.
//!
//! The WAL encodes every record into a scratch buffer before writing it;
//! drawing those buffers from a pool avoids an allocation per append.
//!
//! ## Tiers
//!
//! | tier | capacity |
//! |------|----------|
//! | 0 | 1 KiB |
//! | 1 | 4 KiB |
//! | 2 | 16 KiB |
//! | 3 | 64 KiB |
//! | 4 | 256 KiB |
//!
//! Requests above the largest tier get a fresh exact-size buffer that is
//! never pooled, so one huge payload cannot permanently inflate a bucket.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Capacities of the pool tiers, ascending.
pub const TIER_SIZES: [usize; 5] = [1024, 4 * 1024, 16 * 1024, 64 * 1024, 256 * 1024];

/// Buffers retained per tier; extra returned buffers are dropped.
const MAX_PER_TIER: usize = 64;

/// A pool of byte buffers bucketed by capacity tier.
#[derive(Debug)]
pub struct BufferPool {
    tiers: [Mutex<Vec<Vec<u8>>>; TIER_SIZES.len()],
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

fn tier_for(size: usize) -> Option<usize> {
    TIER_SIZES.iter().position(|&tier| tier >= size)
}

impl BufferPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tiers: std::array::from_fn(|_| Mutex::new(Vec::new())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns a zeroed buffer of length `size`.
    ///
    /// The capacity is the smallest tier that fits, or exactly `size` for
    /// requests above the largest tier.
    #[must_use]
    pub fn get(&self, size: usize) -> Vec<u8> {
        let Some(tier) = tier_for(size) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return vec![0u8; size];
        };

        let pooled = self.tiers[tier].lock().pop();
        let mut buf = match pooled {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(TIER_SIZES[tier])
            }
        };
        buf.clear();
        buf.resize(size, 0);
        buf
    }

    /// Returns a buffer to its tier.
    ///
    /// Only buffers whose capacity is exactly a tier size are kept; a buffer
    /// that grew or was reallocated elsewhere is dropped.
    pub fn put(&self, mut buf: Vec<u8>) {
        let Some(tier) = TIER_SIZES.iter().position(|&t| t == buf.capacity()) else {
            return;
        };
        buf.clear();
        let mut bucket = self.tiers[tier].lock();
        if bucket.len() < MAX_PER_TIER {
            bucket.push(buf);
        }
    }

    /// Buffers currently parked in each tier.
    #[must_use]
    pub fn pooled(&self) -> [usize; TIER_SIZES.len()] {
        std::array::from_fn(|i| self.tiers[i].lock().len())
    }

    /// `(hits, misses)` since creation.
    #[must_use]
    pub fn hit_rate(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
