//! Core traits and types for the caching system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// TTL applied when the caller does not ask for one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// The three storage tiers, in lookup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
  /// In-process map, bounded, volatile
  Memory,
  /// SQLite key-value table, survives restarts, quota-limited
  Persistent,
  /// Transactional object store for large structured values
  Bulk,
}

impl TierKind {
  /// Order in which a layered lookup probes the tiers.
  pub const LOOKUP_ORDER: [TierKind; 3] = [TierKind::Memory, TierKind::Persistent, TierKind::Bulk];

  pub fn name(self) -> &'static str {
    match self {
      TierKind::Memory => "memory",
      TierKind::Persistent => "persistent",
      TierKind::Bulk => "bulk",
    }
  }
}

impl fmt::Display for TierKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl std::str::FromStr for TierKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "memory" | "mem" => Ok(TierKind::Memory),
      "persistent" | "local" => Ok(TierKind::Persistent),
      "bulk" => Ok(TierKind::Bulk),
      other => Err(format!("unknown cache tier '{}'", other)),
    }
  }
}

/// A cached value together with its expiry and tag metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T = Value> {
  pub data: T,
  pub written_at: DateTime<Utc>,
  pub ttl_ms: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub tags: BTreeSet<String>,
}

impl<T> CacheEntry<T> {
  /// Create an entry written now, with TTL/tags/version taken from `options`.
  pub fn new(data: T, options: &CacheOptions) -> Self {
    Self {
      data,
      written_at: Utc::now(),
      ttl_ms: options.ttl_ms(),
      version: options.version.clone(),
      tags: options.tags.iter().cloned().collect(),
    }
  }

  /// An entry is live while `now - written_at < ttl`.
  pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
    let elapsed = now.signed_duration_since(self.written_at).num_milliseconds();
    i128::from(elapsed) < i128::from(self.ttl_ms)
  }

  pub fn is_live(&self) -> bool {
    self.is_live_at(Utc::now())
  }

  pub fn is_expired(&self) -> bool {
    !self.is_live()
  }

  /// Whether the entry carries at least one of `tags`.
  pub fn has_any_tag<S: AsRef<str>>(&self, tags: &[S]) -> bool {
    tags.iter().any(|t| self.tags.contains(t.as_ref()))
  }

  /// Same entry with its TTL lowered to at most `cap_ms`. The write time is kept.
  pub fn with_ttl_cap(mut self, cap_ms: u64) -> Self {
    self.ttl_ms = self.ttl_ms.min(cap_ms);
    self
  }
}

/// Per-call cache options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheOptions {
  /// Time to live; [`DEFAULT_TTL`] when unset
  pub ttl: Option<Duration>,
  /// Labels for bulk invalidation
  pub tags: Vec<String>,
  /// Restrict the operation to one tier
  pub tier: Option<TierKind>,
  pub version: Option<String>,
}

impl CacheOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
    self.tags.push(tag.into());
    self
  }

  pub fn with_tags<I, S>(mut self, tags: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.tags.extend(tags.into_iter().map(Into::into));
    self
  }

  pub fn in_tier(mut self, tier: TierKind) -> Self {
    self.tier = Some(tier);
    self
  }

  pub fn with_version(mut self, version: impl Into<String>) -> Self {
    self.version = Some(version.into());
    self
  }

  pub fn ttl_ms(&self) -> u64 {
    let ttl = self.ttl.unwrap_or(DEFAULT_TTL);
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
  }
}

/// Snapshot of one tier's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub sets: u64,
  /// Writes the tier could not store (quota, serialization, unavailable store)
  pub dropped_sets: u64,
  pub deletes: u64,
  /// Live entry count; approximate for the bulk tier
  pub size: u64,
}

/// Lock-free counters shared by the tier implementations.
#[derive(Debug, Default)]
pub struct StatsRecorder {
  hits: AtomicU64,
  misses: AtomicU64,
  sets: AtomicU64,
  dropped_sets: AtomicU64,
  deletes: AtomicU64,
  size: AtomicU64,
}

impl StatsRecorder {
  pub fn hit(&self) {
    self.hits.fetch_add(1, Ordering::Relaxed);
  }

  pub fn miss(&self) {
    self.misses.fetch_add(1, Ordering::Relaxed);
  }

  pub fn set(&self) {
    self.sets.fetch_add(1, Ordering::Relaxed);
  }

  pub fn dropped_set(&self) {
    self.dropped_sets.fetch_add(1, Ordering::Relaxed);
  }

  pub fn delete(&self) {
    self.deletes.fetch_add(1, Ordering::Relaxed);
  }

  pub fn grow(&self) {
    self.size.fetch_add(1, Ordering::Relaxed);
  }

  pub fn shrink(&self, by: u64) {
    let _ = self
      .size
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| {
        Some(s.saturating_sub(by))
      });
  }

  pub fn set_size(&self, size: u64) {
    self.size.store(size, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> CacheStats {
    CacheStats {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      sets: self.sets.load(Ordering::Relaxed),
      dropped_sets: self.dropped_sets.load(Ordering::Relaxed),
      deletes: self.deletes.load(Ordering::Relaxed),
      size: self.size.load(Ordering::Relaxed),
    }
  }
}

/// Contract shared by every storage tier.
///
/// Operations never fail: backend errors are logged and turned into a miss
/// (reads) or a dropped write. An expired entry found by `get` or `has` is
/// deleted and reported as absent.
#[async_trait]
pub trait StorageTier: Send + Sync {
  fn kind(&self) -> TierKind;

  /// Fetch a live entry.
  async fn get(&self, key: &str) -> Option<CacheEntry>;

  /// Store an entry. Returns false when the write was dropped.
  async fn set(&self, key: &str, entry: CacheEntry) -> bool;

  /// Remove a key. Returns whether it existed.
  async fn delete(&self, key: &str) -> bool;

  /// Remove everything this tier owns.
  async fn clear(&self);

  /// Whether a live entry exists for `key`. Does not touch hit/miss counters.
  async fn has(&self, key: &str) -> bool;

  fn stats(&self) -> CacheStats;
}

/// Join key parts with `:` (e.g. `cache_key(["tools", "page", "2"])`).
pub fn cache_key<I, S>(parts: I) -> String
where
  I: IntoIterator<Item = S>,
  S: ToString,
{
  parts
    .into_iter()
    .map(|p| p.to_string())
    .collect::<Vec<_>>()
    .join(":")
}
