//! Persistent tier: namespaced string key-value store backed by SQLite.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

use super::traits::{CacheEntry, CacheStats, StatsRecorder, StorageTier, TierKind};
use crate::db::{self, schema::PERSISTENT_SCHEMA};

/// Default key prefix for cache rows.
pub const DEFAULT_NAMESPACE: &str = "cache_";

/// Default storage quota (UTF-8 bytes of key + value across the whole table).
pub const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

/// SQLite-based persistent tier.
///
/// Entries are stored as JSON text under `namespace + key`. The table has a
/// fixed quota; a write that would exceed it is dropped, and the tier then
/// sweeps expired rows in its namespace so later writes have room.
pub struct PersistentTier {
  conn: Mutex<Connection>,
  namespace: String,
  quota_bytes: u64,
  stats: StatsRecorder,
}

impl PersistentTier {
  /// Open (or create) the tier at `path`.
  pub fn open(path: &Path, namespace: &str, quota_bytes: u64) -> Result<Self> {
    let conn = db::open(path, PERSISTENT_SCHEMA)?;
    Self::from_connection(conn, namespace, quota_bytes)
  }

  /// In-memory tier, gone when dropped.
  pub fn open_in_memory(namespace: &str, quota_bytes: u64) -> Result<Self> {
    let conn = db::open_in_memory(PERSISTENT_SCHEMA)?;
    Self::from_connection(conn, namespace, quota_bytes)
  }

  fn from_connection(conn: Connection, namespace: &str, quota_bytes: u64) -> Result<Self> {
    let tier = Self {
      conn: Mutex::new(conn),
      namespace: namespace.to_string(),
      quota_bytes,
      stats: StatsRecorder::default(),
    };
    tier.stats.set_size(tier.count_rows()?);
    Ok(tier)
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  fn namespaced(&self, key: &str) -> String {
    format!("{}{}", self.namespace, key)
  }

  fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    f(&conn)
  }

  fn count_rows(&self) -> Result<u64> {
    self.with_conn(|conn| {
      let count: i64 = conn
        .query_row(
          "SELECT COUNT(*) FROM kv_store WHERE substr(key, 1, ?1) = ?2",
          params![self.namespace.chars().count(), self.namespace],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to count cache rows: {}", e))?;
      Ok(count.max(0) as u64)
    })
  }

  fn read_raw(&self, full_key: &str) -> Result<Option<String>> {
    self.with_conn(|conn| {
      conn
        .query_row(
          "SELECT value FROM kv_store WHERE key = ?",
          params![full_key],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read {}: {}", full_key, e))
    })
  }

  /// Write a raw value, enforcing the quota. Returns true when the key is new.
  fn write_raw(&self, full_key: &str, raw: &str) -> Result<bool> {
    self.with_conn(|conn| {
      let (used, existing): (i64, i64) = conn
        .query_row(
          "SELECT
             COALESCE(SUM(CASE WHEN key = ?1 THEN 0 ELSE length(CAST(key AS BLOB)) + length(CAST(value AS BLOB)) END), 0),
             COALESCE(SUM(CASE WHEN key = ?1 THEN 1 ELSE 0 END), 0)
           FROM kv_store",
          params![full_key],
          |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| eyre!("Failed to measure storage usage: {}", e))?;

      let needed = (full_key.len() + raw.len()) as u64;
      if used.max(0) as u64 + needed > self.quota_bytes {
        return Err(eyre!(
          "Quota exceeded writing {} ({} + {} > {} bytes)",
          full_key,
          used,
          needed,
          self.quota_bytes
        ));
      }

      conn
        .execute(
          "INSERT OR REPLACE INTO kv_store (key, value) VALUES (?, ?)",
          params![full_key, raw],
        )
        .map_err(|e| eyre!("Failed to write {}: {}", full_key, e))?;

      Ok(existing == 0)
    })
  }

  fn remove_raw(&self, full_key: &str) -> Result<bool> {
    self.with_conn(|conn| {
      let removed = conn
        .execute("DELETE FROM kv_store WHERE key = ?", params![full_key])
        .map_err(|e| eyre!("Failed to delete {}: {}", full_key, e))?;
      Ok(removed > 0)
    })
  }

  fn remove_namespace(&self) -> Result<usize> {
    self.with_conn(|conn| {
      conn
        .execute(
          "DELETE FROM kv_store WHERE substr(key, 1, ?1) = ?2",
          params![self.namespace.chars().count(), self.namespace],
        )
        .map_err(|e| eyre!("Failed to clear namespace {}: {}", self.namespace, e))
    })
  }

  /// Delete every expired or unreadable row in this namespace.
  pub fn sweep_expired(&self) -> Result<usize> {
    let removed = self.with_conn(|conn| {
      let rows: Vec<(String, String)> = {
        let mut stmt = conn
          .prepare("SELECT key, value FROM kv_store WHERE substr(key, 1, ?1) = ?2")
          .map_err(|e| eyre!("Failed to prepare sweep: {}", e))?;
        let rows = stmt
          .query_map(
            params![self.namespace.chars().count(), self.namespace],
            |row| Ok((row.get(0)?, row.get(1)?)),
          )
          .map_err(|e| eyre!("Failed to scan namespace: {}", e))?
          .filter_map(|r| r.ok())
          .collect();
        rows
      };

      let mut removed = 0;
      for (key, raw) in rows {
        let stale = match serde_json::from_str::<CacheEntry>(&raw) {
          Ok(entry) => entry.is_expired(),
          Err(_) => true,
        };
        if stale {
          removed += conn
            .execute("DELETE FROM kv_store WHERE key = ?", params![key])
            .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;
        }
      }
      Ok(removed)
    })?;

    self.stats.set_size(self.count_rows()?);
    Ok(removed)
  }

  /// Read a live entry, deleting it if expired. Ok(None) means a miss.
  fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
    let full_key = self.namespaced(key);
    let Some(raw) = self.read_raw(&full_key)? else {
      return Ok(None);
    };

    let entry: CacheEntry = serde_json::from_str(&raw)
      .map_err(|e| eyre!("Failed to deserialize {}: {}", full_key, e))?;

    if entry.is_expired() {
      if self.remove_raw(&full_key)? {
        self.stats.shrink(1);
      }
      return Ok(None);
    }
    Ok(Some(entry))
  }

  fn store(&self, key: &str, entry: &CacheEntry) -> Result<()> {
    let full_key = self.namespaced(key);
    let raw = serde_json::to_string(entry)
      .map_err(|e| eyre!("Failed to serialize {}: {}", full_key, e))?;
    if self.write_raw(&full_key, &raw)? {
      self.stats.grow();
    }
    Ok(())
  }
}

#[async_trait]
impl StorageTier for PersistentTier {
  fn kind(&self) -> TierKind {
    TierKind::Persistent
  }

  async fn get(&self, key: &str) -> Option<CacheEntry> {
    match self.load(key) {
      Ok(Some(entry)) => {
        self.stats.hit();
        Some(entry)
      }
      Ok(None) => {
        self.stats.miss();
        None
      }
      Err(e) => {
        warn!("Persistent cache get error: {}", e);
        self.stats.miss();
        None
      }
    }
  }

  async fn set(&self, key: &str, entry: CacheEntry) -> bool {
    match self.store(key, &entry) {
      Ok(()) => {
        self.stats.set();
        true
      }
      Err(e) => {
        warn!("Persistent cache set error: {}", e);
        self.stats.dropped_set();
        // Make room for later writes; this one is not retried.
        match self.sweep_expired() {
          Ok(removed) => debug!(removed, "Swept expired persistent entries"),
          Err(e) => warn!("Persistent cache cleanup error: {}", e),
        }
        false
      }
    }
  }

  async fn delete(&self, key: &str) -> bool {
    match self.remove_raw(&self.namespaced(key)) {
      Ok(true) => {
        self.stats.delete();
        self.stats.shrink(1);
        true
      }
      Ok(false) => false,
      Err(e) => {
        warn!("Persistent cache delete error: {}", e);
        false
      }
    }
  }

  async fn clear(&self) {
    match self.remove_namespace() {
      Ok(_) => self.stats.set_size(0),
      Err(e) => warn!("Persistent cache clear error: {}", e),
    }
  }

  async fn has(&self, key: &str) -> bool {
    match self.load(key) {
      Ok(found) => found.is_some(),
      Err(e) => {
        warn!("Persistent cache has error: {}", e);
        false
      }
    }
  }

  fn stats(&self) -> CacheStats {
    self.stats.snapshot()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheOptions;
  use serde_json::json;
  use std::time::Duration;

  fn tier() -> PersistentTier {
    PersistentTier::open_in_memory(DEFAULT_NAMESPACE, DEFAULT_QUOTA_BYTES).unwrap()
  }

  fn entry(value: serde_json::Value, ttl: Duration) -> CacheEntry {
    CacheEntry::new(value, &CacheOptions::new().with_ttl(ttl))
  }

  #[tokio::test]
  async fn test_roundtrip_under_namespace() {
    let tier = tier();
    assert!(tier.set("a", entry(json!({"n": 1}), Duration::from_secs(60))).await);

    let got = tier.get("a").await.unwrap();
    assert_eq!(got.data, json!({"n": 1}));

    // Stored under the prefixed key
    assert!(tier.read_raw("cache_a").unwrap().is_some());
    assert!(tier.read_raw("a").unwrap().is_none());
    assert_eq!(tier.stats().size, 1);
  }

  #[tokio::test]
  async fn test_expired_entry_is_miss_and_deleted() {
    let tier = tier();
    tier.set("a", entry(json!(1), Duration::from_millis(20))).await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert!(tier.get("a").await.is_none());
    assert!(tier.read_raw("cache_a").unwrap().is_none());
    assert_eq!(tier.stats().misses, 1);
    assert_eq!(tier.stats().size, 0);
  }

  #[tokio::test]
  async fn test_quota_failure_drops_write_and_sweeps() {
    let tier = PersistentTier::open_in_memory(DEFAULT_NAMESPACE, 400).unwrap();
    tier.set("old", entry(json!("x".repeat(100)), Duration::from_millis(10))).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Too big for the remaining quota: dropped, but the expired row is swept
    let big = entry(json!("y".repeat(300)), Duration::from_secs(60));
    assert!(!tier.set("big", big).await);
    assert!(tier.read_raw("cache_old").unwrap().is_none());
    assert!(tier.get("big").await.is_none());

    let stats = tier.stats();
    assert_eq!(stats.dropped_sets, 1);
    assert_eq!(stats.size, 0);

    // The freed space is usable afterwards, but the dropped write was not retried
    assert!(tier.set("small", entry(json!(1), Duration::from_secs(60))).await);
  }

  #[tokio::test]
  async fn test_quota_counts_utf8_bytes() {
    let tier = PersistentTier::open_in_memory(DEFAULT_NAMESPACE, 300).unwrap();

    // About 230 bytes of ASCII fits; the same length in two-byte characters
    // needs about 380 bytes and does not
    assert!(tier.set("ascii", entry(json!("e".repeat(150)), Duration::from_secs(60))).await);
    tier.clear().await;
    assert!(!tier.set("accented", entry(json!("é".repeat(150)), Duration::from_secs(60))).await);
    assert_eq!(tier.stats().dropped_sets, 1);
  }

  #[tokio::test]
  async fn test_clear_only_touches_own_namespace() {
    let conn = db::open_in_memory(PERSISTENT_SCHEMA).unwrap();
    conn
      .execute(
        "INSERT INTO kv_store (key, value) VALUES ('other_key', 'keep')",
        [],
      )
      .unwrap();
    let tier = PersistentTier::from_connection(conn, "cache_", DEFAULT_QUOTA_BYTES).unwrap();

    tier.set("a", entry(json!(1), Duration::from_secs(60))).await;
    tier.clear().await;

    assert!(!tier.has("a").await);
    assert_eq!(tier.read_raw("other_key").unwrap().as_deref(), Some("keep"));
  }

  #[tokio::test]
  async fn test_corrupt_row_reads_as_miss() {
    let tier = tier();
    tier
      .with_conn(|conn| {
        conn
          .execute(
            "INSERT INTO kv_store (key, value) VALUES ('cache_bad', 'not json')",
            [],
          )
          .map_err(|e| eyre!("{}", e))
      })
      .unwrap();

    assert!(tier.get("bad").await.is_none());
    assert_eq!(tier.stats().misses, 1);

    assert_eq!(tier.sweep_expired().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("persistent.db");

    {
      let tier = PersistentTier::open(&path, DEFAULT_NAMESPACE, DEFAULT_QUOTA_BYTES).unwrap();
      tier.set("k", entry(json!([1, 2, 3]), Duration::from_secs(60))).await;
    }

    let tier = PersistentTier::open(&path, DEFAULT_NAMESPACE, DEFAULT_QUOTA_BYTES).unwrap();
    assert_eq!(tier.stats().size, 1);
    assert_eq!(tier.get("k").await.map(|e| e.data), Some(json!([1, 2, 3])));
  }
}
