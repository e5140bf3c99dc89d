//! Multi-tier cache.
//!
//! Three storage tiers sit behind one [`StorageTier`] contract:
//! - [`MemoryTier`]: bounded in-process map, fastest, volatile
//! - [`PersistentTier`]: SQLite string store that survives restarts, quota-limited
//! - [`BulkTier`]: transactional SQLite object store for large structured values
//!
//! [`CacheManager`] layers them with promotion on hit, per-entry TTL and tags.

mod bulk;
mod layer;
mod memory;
mod storage;
mod traits;

pub use bulk::{BulkLocation, BulkTier};
pub use layer::{CacheManager, WarmupEntry, MEMORY_MIRROR_TTL_MS};
pub use memory::{MemoryTier, DEFAULT_MEMORY_CAPACITY};
pub use storage::{PersistentTier, DEFAULT_NAMESPACE, DEFAULT_QUOTA_BYTES};
pub use traits::{
  cache_key, CacheEntry, CacheOptions, CacheStats, StatsRecorder, StorageTier, TierKind,
  DEFAULT_TTL,
};
