//! Bulk tier: transactional object store for large structured values.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{error, warn};

use super::traits::{CacheEntry, CacheStats, StatsRecorder, StorageTier, TierKind};
use crate::db::{self, schema::BULK_SCHEMA};

/// Where the bulk store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkLocation {
  File(PathBuf),
  InMemory,
}

/// Row layout of the object store.
#[derive(Debug, Serialize, Deserialize)]
struct BulkRecord {
  key: String,
  value: CacheEntry,
}

type SharedConnection = Arc<Mutex<Connection>>;

/// Bulk tier backed by a single SQLite object store (`cache` table).
///
/// The connection is opened on first use and reused afterwards. Every
/// operation runs as one transaction on the blocking pool. If the open fails
/// the error is logged once and the tier stays unavailable for the rest of the
/// session: reads miss, writes are dropped.
pub struct BulkTier {
  location: BulkLocation,
  conn: OnceCell<Option<SharedConnection>>,
  stats: Arc<StatsRecorder>,
}

impl BulkTier {
  pub fn new(location: BulkLocation) -> Self {
    Self {
      location,
      conn: OnceCell::new(),
      stats: Arc::new(StatsRecorder::default()),
    }
  }

  pub fn in_memory() -> Self {
    Self::new(BulkLocation::InMemory)
  }

  pub fn location(&self) -> &BulkLocation {
    &self.location
  }

  async fn connection(&self) -> Result<SharedConnection> {
    let conn = self
      .conn
      .get_or_init(|| async {
        let location = self.location.clone();
        let opened = tokio::task::spawn_blocking(move || -> Result<(Connection, u64)> {
          let conn = match &location {
            BulkLocation::File(path) => db::open(path, BULK_SCHEMA)?,
            BulkLocation::InMemory => db::open_in_memory(BULK_SCHEMA)?,
          };
          let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))
            .map_err(|e| eyre!("Failed to count bulk entries: {}", e))?;
          Ok((conn, count.max(0) as u64))
        })
        .await
        .map_err(|e| eyre!("Bulk store open task failed: {}", e))
        .and_then(|r| r);

        match opened {
          Ok((conn, count)) => {
            self.stats.set_size(count);
            Some(Arc::new(Mutex::new(conn)))
          }
          Err(e) => {
            error!("Bulk cache unavailable for this session: {}", e);
            None
          }
        }
      })
      .await;

    conn
      .clone()
      .ok_or_else(|| eyre!("Bulk store unavailable"))
  }

  /// Run `op` inside one transaction on the blocking pool.
  async fn transact<R, F>(&self, op: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce(&rusqlite::Transaction<'_>, &StatsRecorder) -> Result<R> + Send + 'static,
  {
    let conn = self.connection().await?;
    let stats = Arc::clone(&self.stats);

    tokio::task::spawn_blocking(move || {
      let mut conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
      let result = op(&tx, stats.as_ref())?;
      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
      Ok(result)
    })
    .await
    .map_err(|e| eyre!("Bulk store task failed: {}", e))?
  }

  async fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
    let key = key.to_string();
    self
      .transact(move |tx, stats| {
        let raw: Option<String> = tx
          .query_row(
            "SELECT record FROM cache WHERE key = ?",
            params![key],
            |row| row.get(0),
          )
          .optional()
          .map_err(|e| eyre!("Failed to read {}: {}", key, e))?;

        let Some(raw) = raw else {
          return Ok(None);
        };
        let record: BulkRecord = serde_json::from_str(&raw)
          .map_err(|e| eyre!("Failed to deserialize {}: {}", key, e))?;

        if record.value.is_expired() {
          tx.execute("DELETE FROM cache WHERE key = ?", params![key])
            .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;
          stats.shrink(1);
          return Ok(None);
        }
        Ok(Some(record.value))
      })
      .await
  }

  async fn store(&self, key: &str, entry: CacheEntry) -> Result<()> {
    let record = BulkRecord {
      key: key.to_string(),
      value: entry,
    };
    let raw = serde_json::to_string(&record)
      .map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;

    self
      .transact(move |tx, stats| {
        let existed: Option<i64> = tx
          .query_row(
            "SELECT 1 FROM cache WHERE key = ?",
            params![record.key],
            |row| row.get(0),
          )
          .optional()
          .map_err(|e| eyre!("Failed to probe {}: {}", record.key, e))?;

        tx.execute(
          "INSERT OR REPLACE INTO cache (key, record) VALUES (?, ?)",
          params![record.key, raw],
        )
        .map_err(|e| eyre!("Failed to write {}: {}", record.key, e))?;

        if existed.is_none() {
          stats.grow();
        }
        Ok(())
      })
      .await
  }

  async fn remove(&self, key: &str) -> Result<bool> {
    let key = key.to_string();
    self
      .transact(move |tx, _| {
        let removed = tx
          .execute("DELETE FROM cache WHERE key = ?", params![key])
          .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;
        Ok(removed > 0)
      })
      .await
  }
}

#[async_trait]
impl StorageTier for BulkTier {
  fn kind(&self) -> TierKind {
    TierKind::Bulk
  }

  async fn get(&self, key: &str) -> Option<CacheEntry> {
    match self.load(key).await {
      Ok(Some(entry)) => {
        self.stats.hit();
        Some(entry)
      }
      Ok(None) => {
        self.stats.miss();
        None
      }
      Err(e) => {
        warn!("Bulk cache get error: {}", e);
        self.stats.miss();
        None
      }
    }
  }

  async fn set(&self, key: &str, entry: CacheEntry) -> bool {
    match self.store(key, entry).await {
      Ok(()) => {
        self.stats.set();
        true
      }
      Err(e) => {
        warn!("Bulk cache set error: {}", e);
        self.stats.dropped_set();
        false
      }
    }
  }

  async fn delete(&self, key: &str) -> bool {
    match self.remove(key).await {
      Ok(true) => {
        self.stats.delete();
        self.stats.shrink(1);
        true
      }
      Ok(false) => false,
      Err(e) => {
        warn!("Bulk cache delete error: {}", e);
        false
      }
    }
  }

  async fn clear(&self) {
    let cleared = self
      .transact(|tx, _| {
        tx.execute("DELETE FROM cache", [])
          .map_err(|e| eyre!("Failed to clear bulk store: {}", e))
      })
      .await;

    match cleared {
      Ok(_) => self.stats.set_size(0),
      Err(e) => warn!("Bulk cache clear error: {}", e),
    }
  }

  async fn has(&self, key: &str) -> bool {
    match self.load(key).await {
      Ok(found) => found.is_some(),
      Err(e) => {
        warn!("Bulk cache has error: {}", e);
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

  fn entry(value: serde_json::Value, ttl: Duration) -> CacheEntry {
    CacheEntry::new(value, &CacheOptions::new().with_ttl(ttl))
  }

  #[tokio::test]
  async fn test_structured_roundtrip() {
    let tier = BulkTier::in_memory();
    let page = json!({"data": [{"id": "t1"}, {"id": "t2"}], "pagination": {"page": 1}});

    assert!(tier.set("tools:1", entry(page.clone(), Duration::from_secs(60))).await);
    assert_eq!(tier.get("tools:1").await.map(|e| e.data), Some(page));
    assert!(tier.has("tools:1").await);

    let stats = tier.stats();
    assert_eq!(stats.sets, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.size, 1);
  }

  #[tokio::test]
  async fn test_overwrite_does_not_grow_size() {
    let tier = BulkTier::in_memory();
    tier.set("k", entry(json!(1), Duration::from_secs(60))).await;
    tier.set("k", entry(json!(2), Duration::from_secs(60))).await;

    assert_eq!(tier.stats().size, 1);
    assert_eq!(tier.get("k").await.map(|e| e.data), Some(json!(2)));
  }

  #[tokio::test]
  async fn test_expired_entry_removed_on_read() {
    let tier = BulkTier::in_memory();
    tier.set("k", entry(json!(1), Duration::from_millis(20))).await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert!(tier.get("k").await.is_none());
    assert!(!tier.delete("k").await);
    assert_eq!(tier.stats().size, 0);
  }

  #[tokio::test]
  async fn test_delete_and_clear() {
    let tier = BulkTier::in_memory();
    tier.set("a", entry(json!(1), Duration::from_secs(60))).await;
    tier.set("b", entry(json!(2), Duration::from_secs(60))).await;

    assert!(tier.delete("a").await);
    tier.clear().await;

    assert!(!tier.has("b").await);
    assert_eq!(tier.stats().size, 0);
  }

  #[tokio::test]
  async fn test_record_layout_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bulk.db");
    let tier = BulkTier::new(BulkLocation::File(path.clone()));
    tier.set("k", entry(json!({"a": 1}), Duration::from_secs(60))).await;

    let conn = Connection::open(&path).unwrap();
    let raw: String = conn
      .query_row("SELECT record FROM cache WHERE key = 'k'", [], |row| row.get(0))
      .unwrap();
    let record: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(record["key"], json!("k"));
    assert_eq!(record["value"]["data"], json!({"a": 1}));
  }

  #[tokio::test]
  async fn test_failed_open_leaves_tier_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    // A directory cannot be opened as a database file
    let tier = BulkTier::new(BulkLocation::File(dir.path().to_path_buf()));

    assert!(!tier.set("k", entry(json!(1), Duration::from_secs(60))).await);
    assert!(tier.get("k").await.is_none());
    assert!(!tier.has("k").await);

    let stats = tier.stats();
    assert_eq!(stats.dropped_sets, 1);
    assert_eq!(stats.misses, 1);
  }
}
