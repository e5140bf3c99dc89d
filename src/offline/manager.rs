//! Coordinator behind `smart_fetch`.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::queue::{DrainReport, QueueItem, QueueLimits, RequestKind, RequestQueue};
use super::worker::Worker;
use crate::cache::{CacheManager, CacheOptions, TierKind};
use crate::config::{NetworkConfig, OfflineConfig, OfflineConfigUpdate};
use crate::net::{
  ConnectivityEvent, NetworkMonitor, NetworkState, RequestOptions, Subscription, Transport,
};

/// Endpoints fetched by [`OfflineManager::cache_essential_resources`].
pub const ESSENTIAL_RESOURCES: &[&str] = &[
  "/api/categories",
  "/api/tools?limit=50",
  "/api/search/suggestions",
];

/// Path prefixes whose responses are worth serving from cache when offline.
const OFFLINE_CAPABLE_PATHS: &[&str] = &["/api/categories", "/api/tools", "/api/search"];

const LIVE_RESPONSE_TTL: Duration = Duration::from_secs(60 * 60);
const ESSENTIAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cache key for the offline copy of `url`.
pub fn offline_key(url: &str) -> String {
  format!("offline_{}", url)
}

/// Whether `url` belongs to an endpoint family served from cache offline.
pub fn is_offline_capable(url: &str) -> bool {
  OFFLINE_CAPABLE_PATHS.iter().any(|path| url.contains(path))
}

/// Snapshot returned by [`OfflineManager::network_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkStatus {
  pub is_online: bool,
  pub queue_size: usize,
  /// Newest enqueue time among queued requests
  pub last_sync: Option<DateTime<Utc>>,
}

pub(super) struct Inner {
  pub(super) cache: Arc<CacheManager>,
  pub(super) transport: Arc<dyn Transport>,
  pub(super) monitor: NetworkMonitor,
  pub(super) queue: RequestQueue,
  config: Mutex<OfflineConfig>,
  probe_interval: Duration,
  worker: Mutex<Option<Worker>>,
}

/// Offline-aware entry point for all data fetching.
///
/// Composes the network monitor, the request queue and the cache. Cloning is
/// cheap and every clone drives the same state.
#[derive(Clone)]
pub struct OfflineManager {
  pub(super) inner: Arc<Inner>,
}

impl OfflineManager {
  /// Build the manager and rehydrate the persisted queue. Background tasks are
  /// not started; see [`OfflineManager::start`].
  pub async fn new(
    cache: Arc<CacheManager>,
    transport: Arc<dyn Transport>,
    config: OfflineConfig,
    network: &NetworkConfig,
  ) -> Self {
    let queue = RequestQueue::load(cache.clone(), limits_of(&config)).await;
    let monitor = NetworkMonitor::new(
      transport.clone(),
      network.probe_path.clone(),
      network.assume_online,
    );

    Self {
      inner: Arc::new(Inner {
        cache,
        transport,
        monitor,
        queue,
        config: Mutex::new(config),
        probe_interval: network.probe_interval(),
        worker: Mutex::new(None),
      }),
    }
  }

  pub fn cache(&self) -> &CacheManager {
    &self.inner.cache
  }

  pub fn config(&self) -> OfflineConfig {
    self
      .inner
      .config
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub(super) fn sync_interval(&self) -> Duration {
    self.config().sync_interval()
  }

  pub(super) fn probe_interval(&self) -> Duration {
    self.inner.probe_interval
  }

  /// Fetch `url` with offline fallback.
  ///
  /// Online: try the network; a success is cached (bulk tier, tagged
  /// `offline`, 1h) and returned. On failure a mutating request is queued and
  /// the cached copy, if any, is returned.
  ///
  /// Offline: a mutating request is queued and `None` is returned without
  /// touching the network; reads are served from cache.
  pub async fn smart_fetch<T: DeserializeOwned>(&self, url: &str, options: RequestOptions) -> Option<T> {
    let mutating = options.method.is_mutating();

    if !self.inner.monitor.is_online() {
      if mutating {
        self.queue_request(url, options, RequestKind::Api).await;
        return None;
      }
      return self.get_offline_data(url).await;
    }

    match self.fetch_live::<T>(url, &options).await {
      Ok((raw, data)) => {
        let cache_options = CacheOptions::new()
          .in_tier(TierKind::Bulk)
          .with_ttl(LIVE_RESPONSE_TTL)
          .with_tag("offline");
        self
          .inner
          .cache
          .set(&offline_key(url), &raw, &cache_options)
          .await;
        Some(data)
      }
      Err(e) => {
        warn!("Live request failed, trying offline cache: {}: {}", url, e);
        if mutating {
          self.queue_request(url, options, RequestKind::Api).await;
        }
        self.get_offline_data(url).await
      }
    }
  }

  async fn fetch_live<T: DeserializeOwned>(&self, url: &str, options: &RequestOptions) -> Result<(Value, T)> {
    let raw = self.inner.transport.send(&options.to_request(url)).await?;
    let data = serde_json::from_value(raw.clone())
      .map_err(|e| eyre!("Unexpected response shape from {}: {}", url, e))?;
    Ok((raw, data))
  }

  /// Queue a request for replay once connectivity allows.
  pub async fn queue_request(&self, url: &str, options: RequestOptions, kind: RequestKind) {
    let max_retries = self.config().max_retries;
    let item = QueueItem::new(url, &options, kind, max_retries);
    self.inner.queue.enqueue(item).await;
  }

  /// Deliver a write now, or queue it when offline or when delivery fails.
  ///
  /// Returns true only when the server accepted the request. Unlike
  /// `smart_fetch` this never answers from cache, so a queued write is never
  /// mistaken for a delivered one.
  pub async fn send_or_queue(&self, url: &str, options: RequestOptions, kind: RequestKind) -> bool {
    if self.inner.monitor.is_online() {
      match self.inner.transport.send(&options.to_request(url)).await {
        Ok(_) => return true,
        Err(e) => warn!("Request failed, queueing for replay: {}: {}", url, e),
      }
    }
    self.queue_request(url, options, kind).await;
    false
  }

  /// Cached copy of `url` stored by `smart_fetch` or the essential precache.
  pub async fn get_offline_data<T: DeserializeOwned>(&self, url: &str) -> Option<T> {
    self
      .inner
      .cache
      .get(&offline_key(url), &CacheOptions::new())
      .await
  }

  /// Fetch the fixed essential endpoints into the bulk tier for 24 hours.
  /// Returns how many were cached.
  pub async fn cache_essential_resources(&self) -> usize {
    info!("Caching essential resources");
    let options = CacheOptions::new()
      .in_tier(TierKind::Bulk)
      .with_ttl(ESSENTIAL_TTL)
      .with_tags(["offline", "essential"]);

    let mut cached = 0;
    for url in ESSENTIAL_RESOURCES {
      match self.fetch_live::<Value>(url, &RequestOptions::get()).await {
        Ok((raw, _)) => {
          if self.inner.cache.set(&offline_key(url), &raw, &options).await {
            debug!(url, "Cached essential resource");
            cached += 1;
          }
        }
        Err(e) => warn!("Failed to cache {}: {}", url, e),
      }
    }

    info!(cached, total = ESSENTIAL_RESOURCES.len(), "Essential resources cached");
    cached
  }

  /// Register a connectivity callback; it receives the new online flag.
  pub fn on_network_change<F>(&self, callback: F) -> Subscription
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    self.inner.monitor.on_change(callback)
  }

  pub fn network_state(&self) -> NetworkState {
    self.inner.monitor.state()
  }

  pub fn network_status(&self) -> NetworkStatus {
    NetworkStatus {
      is_online: self.inner.monitor.is_online(),
      queue_size: self.inner.queue.len(),
      last_sync: self.inner.queue.last_enqueued_at(),
    }
  }

  pub fn queued_requests(&self) -> Vec<QueueItem> {
    self.inner.queue.snapshot()
  }

  /// Apply a platform connectivity event, draining on reconnect.
  pub async fn handle_connectivity(&self, event: ConnectivityEvent) {
    if self.inner.monitor.handle_event(event) {
      self.drain().await;
    }
  }

  /// Run one liveness probe, draining on an offline to online transition.
  pub async fn probe(&self) {
    if self.inner.monitor.probe().await {
      self.drain().await;
    }
  }

  /// Replay the queue now if online.
  pub async fn force_sync(&self) -> Option<DrainReport> {
    if !self.inner.monitor.is_online() {
      debug!("Skipping sync while offline");
      return None;
    }
    Some(self.drain().await)
  }

  pub(super) async fn drain(&self) -> DrainReport {
    self.inner.queue.drain(self.inner.transport.as_ref()).await
  }

  pub async fn clear_queue(&self) {
    self.inner.queue.clear().await;
  }

  /// Change tunables at runtime. A new sync interval applies from the next
  /// timer cycle. An invalid update is rejected whole.
  pub fn update_config(&self, update: OfflineConfigUpdate) -> Result<()> {
    let limits = {
      let mut config = self
        .inner
        .config
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      config.apply(update)?;
      limits_of(&config)
    };
    self.inner.queue.set_limits(limits);
    Ok(())
  }

  /// Spawn the probe and sync loops. Calling it again while running is a no-op.
  pub fn start(&self) {
    let mut worker = self
      .inner
      .worker
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if worker.is_none() {
      *worker = Some(Worker::spawn(self));
    }
  }

  pub fn is_running(&self) -> bool {
    self
      .inner
      .worker
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .is_some()
  }

  /// Stop the background loops and wait for them to finish.
  pub async fn shutdown(&self) {
    let worker = self
      .inner
      .worker
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(worker) = worker {
      worker.stop().await;
    }
  }
}

fn limits_of(config: &OfflineConfig) -> QueueLimits {
  QueueLimits {
    max_queue_size: config.max_queue_size,
    critical_paths: config.critical_paths.clone(),
  }
}
