//! Memory governance: byte budgets and pooled buffers.

mod buffer_pool;
mod governor;

pub use buffer_pool::{BufferPool, TIER_SIZES};
pub use governor::{DbMemoryUsage, GovernorStats, MemoryGovernor};
