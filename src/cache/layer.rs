//! Cache manager that layers the storage tiers.

use color_eyre::Result;
use futures::future::join_all;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use tracing::{debug, warn};

use super::bulk::{BulkLocation, BulkTier};
use super::memory::MemoryTier;
use super::storage::PersistentTier;
use super::traits::{CacheEntry, CacheOptions, CacheStats, StorageTier, TierKind};
use crate::config::CacheConfig;

/// Longest TTL a value mirrored into memory by a slower-tier `set` gets.
pub const MEMORY_MIRROR_TTL_MS: u64 = 60_000;

/// One item for [`CacheManager::warmup`].
#[derive(Debug, Clone)]
pub struct WarmupEntry<T> {
  pub key: String,
  pub value: T,
  pub options: CacheOptions,
}

/// Multi-tier cache: memory, then persistent, then bulk.
///
/// Reads without an explicit tier probe the tiers in that order and promote a
/// hit from a slower tier into memory, keeping its original write time and
/// TTL. Writes to a slower tier are mirrored into memory with the TTL capped
/// at [`MEMORY_MIRROR_TTL_MS`]. Tier failures never surface from here: reads
/// miss and writes are logged and dropped.
pub struct CacheManager {
  memory: MemoryTier,
  persistent: PersistentTier,
  bulk: BulkTier,
}

impl CacheManager {
  pub fn new(memory: MemoryTier, persistent: PersistentTier, bulk: BulkTier) -> Self {
    Self {
      memory,
      persistent,
      bulk,
    }
  }

  /// Open file-backed tiers under `data_dir`.
  pub fn open(config: &CacheConfig, data_dir: &Path) -> Result<Self> {
    let persistent = PersistentTier::open(
      &data_dir.join("persistent.db"),
      &config.persistent_namespace,
      config.persistent_quota_bytes,
    )?;
    let bulk = BulkTier::new(BulkLocation::File(data_dir.join("bulk.db")));

    Ok(Self::new(
      MemoryTier::new(config.memory_capacity),
      persistent,
      bulk,
    ))
  }

  /// Cache whose every tier lives in process memory.
  pub fn in_memory(config: &CacheConfig) -> Result<Self> {
    let persistent =
      PersistentTier::open_in_memory(&config.persistent_namespace, config.persistent_quota_bytes)?;

    Ok(Self::new(
      MemoryTier::new(config.memory_capacity),
      persistent,
      BulkTier::in_memory(),
    ))
  }

  fn tier(&self, kind: TierKind) -> &dyn StorageTier {
    match kind {
      TierKind::Memory => &self.memory,
      TierKind::Persistent => &self.persistent,
      TierKind::Bulk => &self.bulk,
    }
  }

  /// Read `key`, decoding it as `T`.
  ///
  /// With `options.tier` set only that tier is read; otherwise tiers are
  /// probed fastest first and a slower-tier hit is promoted into memory.
  pub async fn get<T: DeserializeOwned>(&self, key: &str, options: &CacheOptions) -> Option<T> {
    let entry = self.get_entry(key, options.tier).await?;
    match serde_json::from_value(entry.data) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!("Cached value for {} has unexpected shape: {}", key, e);
        None
      }
    }
  }

  /// Read the raw entry for `key`, with promotion.
  pub async fn get_entry(&self, key: &str, tier: Option<TierKind>) -> Option<CacheEntry> {
    if let Some(kind) = tier {
      return self.tier(kind).get(key).await;
    }

    for kind in TierKind::LOOKUP_ORDER {
      let Some(entry) = self.tier(kind).get(key).await else {
        continue;
      };

      if kind != TierKind::Memory {
        debug!(key, from = %kind, "Promoting cache entry to memory");
        self.memory.set(key, entry.clone()).await;
      }
      return Some(entry);
    }

    None
  }

  /// Store `value` under `key` in `options.tier` (memory by default).
  ///
  /// Returns false when the target tier dropped the write.
  pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: &CacheOptions) -> bool {
    let data = match serde_json::to_value(value) {
      Ok(data) => data,
      Err(e) => {
        warn!("Failed to serialize cache value for {}: {}", key, e);
        return false;
      }
    };

    let target = options.tier.unwrap_or(TierKind::Memory);
    let entry = CacheEntry::new(data, options);

    if target == TierKind::Memory {
      return self.memory.set(key, entry).await;
    }

    let stored = self.tier(target).set(key, entry.clone()).await;
    if !stored {
      warn!(key, tier = %target, "Cache write dropped");
    }
    self
      .memory
      .set(key, entry.with_ttl_cap(MEMORY_MIRROR_TTL_MS))
      .await;
    stored
  }

  /// Delete `key` from one tier, or from every tier when `tier` is None.
  pub async fn delete(&self, key: &str, tier: Option<TierKind>) -> bool {
    if let Some(kind) = tier {
      return self.tier(kind).delete(key).await;
    }

    let mut deleted = false;
    for kind in TierKind::LOOKUP_ORDER {
      deleted |= self.tier(kind).delete(key).await;
    }
    deleted
  }

  /// Clear one tier, or all of them.
  pub async fn clear(&self, tier: Option<TierKind>) {
    match tier {
      Some(kind) => self.tier(kind).clear().await,
      None => {
        join_all(TierKind::LOOKUP_ORDER.map(|kind| self.tier(kind).clear())).await;
      }
    }
  }

  /// Whether a live entry exists in one tier, or in any tier.
  pub async fn has(&self, key: &str, tier: Option<TierKind>) -> bool {
    if let Some(kind) = tier {
      return self.tier(kind).has(key).await;
    }

    for kind in TierKind::LOOKUP_ORDER {
      if self.tier(kind).has(key).await {
        return true;
      }
    }
    false
  }

  /// Drop memory entries carrying any of `tags`.
  ///
  /// Only the memory tier is scanned; slower tiers keep no tag index. Pair
  /// with [`CacheManager::delete`] when a key must be gone everywhere.
  pub async fn clear_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
    let removed = self.memory.clear_by_tags(tags);
    debug!(removed, "Cleared memory entries by tag");
    removed
  }

  /// Per-tier counters.
  pub fn stats(&self) -> BTreeMap<TierKind, CacheStats> {
    TierKind::LOOKUP_ORDER
      .into_iter()
      .map(|kind| (kind, self.tier(kind).stats()))
      .collect()
  }

  /// Store several values up front.
  pub async fn warmup<T: Serialize>(&self, entries: &[WarmupEntry<T>]) -> usize {
    let mut stored = 0;
    for entry in entries {
      if self.set(&entry.key, &entry.value, &entry.options).await {
        stored += 1;
      }
    }
    stored
  }

  /// Read-through helper: return the cached value, or run `fetcher`, store
  /// its result and return it. Fetch errors are returned unchanged.
  pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, options: &CacheOptions, fetcher: F) -> Result<T>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if let Some(cached) = self.get(key, options).await {
      return Ok(cached);
    }

    let data = fetcher().await?;
    self.set(key, &data, options).await;
    Ok(data)
  }
}
