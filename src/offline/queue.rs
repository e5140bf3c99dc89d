//! Durable FIFO of writes waiting for connectivity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheManager, CacheOptions, TierKind};
use crate::net::{HttpMethod, OutboundRequest, RequestOptions, Transport};

/// Persistent-tier key holding the queue snapshot.
pub const QUEUE_STORAGE_KEY: &str = "offline_queue";

/// Items older than this are discarded when the queue is loaded.
pub const QUEUE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// What produced a queued request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
  #[default]
  Api,
  Analytics,
  UserAction,
}

/// A write waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
  pub id: String,
  pub kind: RequestKind,
  pub url: String,
  pub method: HttpMethod,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub payload: Option<Value>,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
  pub max_retries: u32,
}

impl QueueItem {
  pub fn new(url: &str, options: &RequestOptions, kind: RequestKind, max_retries: u32) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      kind,
      url: url.to_string(),
      method: options.method,
      payload: options.body.clone(),
      enqueued_at: Utc::now(),
      retry_count: 0,
      max_retries,
    }
  }

  /// The request replayed for this item. Headers are not kept.
  pub fn to_request(&self) -> OutboundRequest {
    OutboundRequest {
      url: self.url.clone(),
      method: self.method,
      body: self.payload.clone(),
      headers: Vec::new(),
    }
  }

  pub fn is_older_than(&self, age: Duration, now: DateTime<Utc>) -> bool {
    let max_age_ms = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
    now.signed_duration_since(self.enqueued_at).num_milliseconds() >= max_age_ms
  }

  /// Whether the item's path starts with one of `critical_paths`.
  pub fn is_critical(&self, critical_paths: &[String]) -> bool {
    let path = request_path(&self.url);
    critical_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
  }
}

/// Path (plus query) of an absolute URL, or the input when it is relative.
fn request_path(url: &str) -> String {
  match Url::parse(url) {
    Ok(parsed) => match parsed.query() {
      Some(query) => format!("{}?{}", parsed.path(), query),
      None => parsed.path().to_string(),
    },
    Err(_) => url.to_string(),
  }
}

/// Size and eviction rules handed down by the owner.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueLimits {
  pub max_queue_size: usize,
  pub critical_paths: Vec<String>,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  pub attempted: usize,
  pub succeeded: usize,
  /// Items removed after reaching their retry cap
  pub dropped: usize,
  /// Items left for the next pass
  pub remaining: usize,
  /// Another drain was already running; nothing was attempted
  pub skipped: bool,
}

/// Bounded FIFO of pending writes, persisted through the cache's persistent
/// tier after every mutation.
pub struct RequestQueue {
  items: Mutex<VecDeque<QueueItem>>,
  limits: Mutex<QueueLimits>,
  cache: Arc<CacheManager>,
  draining: AtomicBool,
  /// Serializes snapshot writes so the last mutation is the one stored
  persist_lock: tokio::sync::Mutex<()>,
}

impl RequestQueue {
  /// Rehydrate the queue from its stored snapshot, discarding stale items.
  pub async fn load(cache: Arc<CacheManager>, limits: QueueLimits) -> Self {
    let options = CacheOptions::new().in_tier(TierKind::Persistent);
    let raw: Vec<Value> = cache
      .get(QUEUE_STORAGE_KEY, &options)
      .await
      .unwrap_or_default();

    // Decode item by item so one bad record does not cost the whole queue
    let stored: Vec<QueueItem> = raw
      .into_iter()
      .filter_map(|value| match serde_json::from_value(value) {
        Ok(item) => Some(item),
        Err(e) => {
          warn!("Skipping unreadable queued request: {}", e);
          None
        }
      })
      .collect();

    let now = Utc::now();
    let total = stored.len();
    let items: VecDeque<QueueItem> = stored
      .into_iter()
      .filter(|item| !item.is_older_than(QUEUE_MAX_AGE, now))
      .collect();

    if total > 0 {
      info!(
        restored = items.len(),
        expired = total - items.len(),
        "Loaded offline queue"
      );
    }

    Self {
      items: Mutex::new(items),
      limits: Mutex::new(limits),
      cache,
      draining: AtomicBool::new(false),
      persist_lock: tokio::sync::Mutex::new(()),
    }
  }

  fn lock_items(&self) -> MutexGuard<'_, VecDeque<QueueItem>> {
    self.items.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn limits(&self) -> QueueLimits {
    self
      .limits
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn set_limits(&self, limits: QueueLimits) {
    *self.limits.lock().unwrap_or_else(PoisonError::into_inner) = limits;
  }

  pub fn len(&self) -> usize {
    self.lock_items().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock_items().is_empty()
  }

  pub fn snapshot(&self) -> Vec<QueueItem> {
    self.lock_items().iter().cloned().collect()
  }

  /// Newest enqueue time among queued items.
  pub fn last_enqueued_at(&self) -> Option<DateTime<Utc>> {
    self.lock_items().iter().map(|item| item.enqueued_at).max()
  }

  /// Append `item`, evicting to stay within `max_queue_size`.
  ///
  /// Eviction takes the oldest non-critical item first and falls back to the
  /// oldest item of all when everything queued is critical. Returns the
  /// evicted items.
  pub async fn enqueue(&self, item: QueueItem) -> Vec<QueueItem> {
    let limits = self.limits();
    let mut evicted = Vec::new();

    {
      let mut items = self.lock_items();
      while !items.is_empty() && items.len() >= limits.max_queue_size {
        let victim = items
          .iter()
          .position(|queued| !queued.is_critical(&limits.critical_paths))
          .unwrap_or(0);
        if let Some(removed) = items.remove(victim) {
          evicted.push(removed);
        }
      }
      debug!(url = %item.url, method = %item.method, "Queued request");
      items.push_back(item);
    }

    for removed in &evicted {
      warn!(url = %removed.url, "Offline queue full, evicted request");
    }

    self.persist().await;
    evicted
  }

  /// Remove every item.
  pub async fn clear(&self) {
    self.lock_items().clear();
    self.persist().await;
  }

  /// Replay every queued item once, in FIFO order.
  ///
  /// Successes are removed. Failures bump `retry_count` and are dropped once
  /// it reaches `max_retries`; the rest stay queued in their original order.
  pub async fn drain(&self, transport: &dyn Transport) -> DrainReport {
    if self.draining.swap(true, Ordering::SeqCst) {
      debug!("Drain already in progress");
      return DrainReport {
        skipped: true,
        remaining: self.len(),
        ..DrainReport::default()
      };
    }
    let _guard = DrainGuard(&self.draining);

    let pending = self.snapshot();
    if pending.is_empty() {
      return DrainReport::default();
    }
    info!("Syncing {} queued requests", pending.len());

    let mut succeeded = HashSet::new();
    let mut failed = HashSet::new();
    for item in &pending {
      match transport.send(&item.to_request()).await {
        Ok(_) => {
          debug!(url = %item.url, "Replayed queued request");
          succeeded.insert(item.id.clone());
        }
        Err(e) => {
          warn!(url = %item.url, "Queued request failed: {}", e);
          failed.insert(item.id.clone());
        }
      }
    }

    let mut dropped = 0;
    let remaining = {
      let mut items = self.lock_items();
      items.retain_mut(|item| {
        if succeeded.contains(&item.id) {
          return false;
        }
        if failed.contains(&item.id) {
          item.retry_count += 1;
          if item.retry_count >= item.max_retries {
            error!(
              url = %item.url,
              retries = item.retry_count,
              "Request reached max retries, giving up"
            );
            dropped += 1;
            return false;
          }
        }
        true
      });
      items.len()
    };

    self.persist().await;

    if !succeeded.is_empty() || dropped > 0 {
      info!(
        "Sync finished: {} succeeded, {} dropped",
        succeeded.len(),
        dropped
      );
    }

    DrainReport {
      attempted: pending.len(),
      succeeded: succeeded.len(),
      dropped,
      remaining,
      skipped: false,
    }
  }

  async fn persist(&self) {
    let _write = self.persist_lock.lock().await;
    let snapshot = self.snapshot();
    let options = CacheOptions::new()
      .in_tier(TierKind::Persistent)
      .with_ttl(QUEUE_MAX_AGE);

    if !self.cache.set(QUEUE_STORAGE_KEY, &snapshot, &options).await {
      warn!(items = snapshot.len(), "Failed to save offline queue");
    }
  }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::CacheConfig;
  use crate::net::testing::ScriptedTransport;
  use chrono::Duration as ChronoDuration;
  use serde_json::json;

  fn limits(max: usize) -> QueueLimits {
    QueueLimits {
      max_queue_size: max,
      critical_paths: vec!["/api/tools".to_string(), "/api/categories".to_string()],
    }
  }

  fn cache() -> Arc<CacheManager> {
    Arc::new(CacheManager::in_memory(&CacheConfig::default()).unwrap())
  }

  fn post(url: &str, max_retries: u32) -> QueueItem {
    QueueItem::new(url, &RequestOptions::post(json!({"url": url})), RequestKind::Api, max_retries)
  }

  fn urls(queue: &RequestQueue) -> Vec<String> {
    queue.snapshot().into_iter().map(|i| i.url).collect()
  }

  #[tokio::test]
  async fn test_fifo_replay_empties_queue() {
    let queue = RequestQueue::load(cache(), limits(10)).await;
    for url in ["/a", "/b", "/c"] {
      queue.enqueue(post(url, 3)).await;
    }

    let transport = ScriptedTransport::new();
    let report = queue.drain(&transport).await;

    assert_eq!(transport.request_urls(), vec!["/a", "/b", "/c"]);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.remaining, 0);
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_retry_cap_drops_after_max_attempts() {
    let queue = RequestQueue::load(cache(), limits(10)).await;
    queue.enqueue(post("/broken", 3)).await;

    let transport = ScriptedTransport::new();
    transport.fail("/broken");

    for pass in 1..=2 {
      let report = queue.drain(&transport).await;
      assert_eq!(report.dropped, 0);
      assert_eq!(queue.snapshot()[0].retry_count, pass);
    }
    let report = queue.drain(&transport).await;
    assert_eq!(report.dropped, 1);
    assert!(queue.is_empty());

    assert_eq!(transport.requests().len(), 3);
    // Nothing left to attempt
    queue.drain(&transport).await;
    assert_eq!(transport.requests().len(), 3);
  }

  #[tokio::test]
  async fn test_survivors_keep_relative_order() {
    let queue = RequestQueue::load(cache(), limits(10)).await;
    for url in ["/a", "/b", "/c", "/d"] {
      queue.enqueue(post(url, 5)).await;
    }

    let transport = ScriptedTransport::new();
    transport.fail("/b");
    transport.fail("/d");
    queue.drain(&transport).await;

    assert_eq!(urls(&queue), vec!["/b", "/d"]);
  }

  #[tokio::test]
  async fn test_overflow_evicts_oldest_non_critical() {
    let queue = RequestQueue::load(cache(), limits(3)).await;
    queue.enqueue(post("/api/tools/1", 3)).await;
    queue.enqueue(post("/api/reviews", 3)).await;
    queue.enqueue(post("/api/analytics/click", 3)).await;

    let evicted = queue.enqueue(post("/api/reviews/2", 3)).await;

    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].url, "/api/reviews");
    assert_eq!(queue.len(), 3);
    assert_eq!(
      urls(&queue),
      vec!["/api/tools/1", "/api/analytics/click", "/api/reviews/2"]
    );
  }

  #[tokio::test]
  async fn test_overflow_with_only_critical_evicts_oldest() {
    let queue = RequestQueue::load(cache(), limits(2)).await;
    queue.enqueue(post("/api/tools/1", 3)).await;
    queue.enqueue(post("/api/categories", 3)).await;
    queue.enqueue(post("/api/tools/2", 3)).await;

    assert_eq!(urls(&queue), vec!["/api/categories", "/api/tools/2"]);
  }

  #[tokio::test]
  async fn test_critical_match_uses_path_of_absolute_urls() {
    let paths = limits(1).critical_paths;
    assert!(post("https://tools.example.com/api/tools/9", 3).is_critical(&paths));
    assert!(!post("https://tools.example.com/x/api/tools", 3).is_critical(&paths));
    assert!(!post("/api/reviews", 3).is_critical(&paths));
  }

  #[tokio::test]
  async fn test_snapshot_persisted_and_reloaded() {
    let cache = cache();
    let queue = RequestQueue::load(cache.clone(), limits(10)).await;
    queue.enqueue(post("/a", 3)).await;
    queue.enqueue(post("/b", 3)).await;

    let reloaded = RequestQueue::load(cache.clone(), limits(10)).await;
    assert_eq!(reloaded.snapshot(), queue.snapshot());

    queue.clear().await;
    let reloaded = RequestQueue::load(cache, limits(10)).await;
    assert!(reloaded.is_empty());
  }

  #[tokio::test]
  async fn test_stale_items_discarded_on_load() {
    let cache = cache();
    let mut stale = post("/old", 3);
    stale.enqueued_at = Utc::now() - ChronoDuration::hours(25);
    let fresh = post("/new", 3);

    let options = CacheOptions::new()
      .in_tier(TierKind::Persistent)
      .with_ttl(QUEUE_MAX_AGE);
    cache
      .set(QUEUE_STORAGE_KEY, &vec![stale, fresh.clone()], &options)
      .await;

    let queue = RequestQueue::load(cache, limits(10)).await;
    assert_eq!(queue.snapshot(), vec![fresh]);
  }

  #[tokio::test]
  async fn test_malformed_item_skipped_on_load() {
    let cache = cache();
    let good = post("/kept", 3);
    let options = CacheOptions::new()
      .in_tier(TierKind::Persistent)
      .with_ttl(QUEUE_MAX_AGE);
    cache
      .set(
        QUEUE_STORAGE_KEY,
        &json!([{"url": "/broken", "method": "POST"}, good]),
        &options,
      )
      .await;

    let queue = RequestQueue::load(cache.clone(), limits(10)).await;
    assert_eq!(queue.snapshot(), vec![good]);

    // The surviving item is written back on the next mutation
    queue.enqueue(post("/next", 3)).await;
    let reloaded = RequestQueue::load(cache, limits(10)).await;
    assert_eq!(urls(&reloaded), vec!["/kept", "/next"]);
  }

  #[tokio::test]
  async fn test_queue_survives_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig::default();

    {
      let cache = Arc::new(CacheManager::open(&config, dir.path()).unwrap());
      let queue = RequestQueue::load(cache, limits(10)).await;
      queue.enqueue(post("/a", 3)).await;
    }

    let cache = Arc::new(CacheManager::open(&config, dir.path()).unwrap());
    let queue = RequestQueue::load(cache, limits(10)).await;
    assert_eq!(urls(&queue), vec!["/a"]);
  }

  #[test]
  fn test_item_serializes_with_kebab_kind() {
    let item = QueueItem::new(
      "/api/analytics/click",
      &RequestOptions::post(json!({"toolId": "t1"})),
      RequestKind::UserAction,
      3,
    );
    let json = serde_json::to_value(&item).unwrap();
    assert_eq!(json["kind"], json!("user-action"));
    assert_eq!(json["method"], json!("POST"));
    assert_eq!(json["retry_count"], json!(0));
  }
}
