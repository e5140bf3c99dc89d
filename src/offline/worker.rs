//! Background probe and sync loops.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::manager::{Inner, OfflineManager};

/// Shortest period either loop will wait between runs.
const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Running loops owned by an [`OfflineManager`].
///
/// The loops hold a weak reference to the manager so a forgotten `shutdown`
/// does not keep it alive; each loop exits once the manager is gone.
pub(super) struct Worker {
  shutdown: watch::Sender<bool>,
  handles: Vec<JoinHandle<()>>,
}

impl Worker {
  pub(super) fn spawn(manager: &OfflineManager) -> Self {
    let (shutdown, rx) = watch::channel(false);
    let weak = Arc::downgrade(&manager.inner);

    let handles = vec![
      tokio::spawn(probe_loop(weak.clone(), manager.probe_interval(), rx.clone())),
      tokio::spawn(sync_loop(weak, rx)),
    ];
    debug!("Started offline background tasks");

    Self { shutdown, handles }
  }

  pub(super) async fn stop(self) {
    let _ = self.shutdown.send(true);
    for handle in self.handles {
      if let Err(e) = handle.await {
        warn!("Background task ended abnormally: {}", e);
      }
    }
    debug!("Stopped offline background tasks");
  }
}

fn upgrade(weak: &Weak<Inner>) -> Option<OfflineManager> {
  weak.upgrade().map(|inner| OfflineManager { inner })
}

async fn probe_loop(weak: Weak<Inner>, period: Duration, mut shutdown: watch::Receiver<bool>) {
  let period = period.max(MIN_PERIOD);
  let mut ticker = time::interval_at(Instant::now() + period, period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      _ = shutdown.changed() => break,
      _ = ticker.tick() => {
        let Some(manager) = upgrade(&weak) else { break };
        manager.probe().await;
      }
    }
  }
}

async fn sync_loop(weak: Weak<Inner>, mut shutdown: watch::Receiver<bool>) {
  loop {
    // Re-read each cycle so interval updates take effect
    let Some(period) = upgrade(&weak).map(|m| m.sync_interval().max(MIN_PERIOD)) else {
      break;
    };

    tokio::select! {
      _ = shutdown.changed() => break,
      _ = time::sleep(period) => {
        let Some(manager) = upgrade(&weak) else { break };
        if manager.network_state().is_online() && manager.network_status().queue_size > 0 {
          manager.drain().await;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use crate::cache::CacheManager;
  use crate::config::{CacheConfig, NetworkConfig, OfflineConfig};
  use crate::net::testing::ScriptedTransport;
  use crate::net::RequestOptions;
  use crate::offline::{OfflineManager, RequestKind};
  use serde_json::json;
  use std::sync::Arc;
  use std::time::Duration;

  async fn manager(sync_ms: u64, probe_ms: u64) -> (OfflineManager, Arc<ScriptedTransport>) {
    let cache = Arc::new(CacheManager::in_memory(&CacheConfig::default()).unwrap());
    let transport = Arc::new(ScriptedTransport::new());
    let config = OfflineConfig {
      sync_interval_ms: sync_ms,
      ..OfflineConfig::default()
    };
    let network = NetworkConfig {
      probe_interval_ms: probe_ms,
      ..NetworkConfig::default()
    };
    let manager = OfflineManager::new(cache, transport.clone(), config, &network).await;
    (manager, transport)
  }

  #[tokio::test]
  async fn test_sync_loop_drains_queue() {
    let (manager, transport) = manager(20, 60_000).await;
    manager
      .queue_request("/api/reviews", RequestOptions::post(json!({})), RequestKind::Api)
      .await;

    manager.start();
    for _ in 0..100 {
      if manager.network_status().queue_size == 0 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    manager.shutdown().await;

    assert_eq!(manager.network_status().queue_size, 0);
    assert_eq!(transport.request_urls(), vec!["/api/reviews"]);
  }

  #[tokio::test]
  async fn test_probe_loop_detects_outage() {
    let (manager, transport) = manager(60_000, 20).await;
    transport.set_reachable(false);

    manager.start();
    for _ in 0..100 {
      if !manager.network_state().is_online() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    manager.shutdown().await;

    assert!(!manager.network_state().is_online());
    assert!(!transport.probes().is_empty());
  }

  #[tokio::test]
  async fn test_zero_periods_do_not_stop_the_loops() {
    let (manager, transport) = manager(0, 0).await;
    manager
      .queue_request("/api/reviews", RequestOptions::post(json!({})), RequestKind::Api)
      .await;

    manager.start();
    for _ in 0..100 {
      if manager.network_status().queue_size == 0 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(manager.network_status().queue_size, 0);

    transport.set_reachable(false);
    for _ in 0..100 {
      if !manager.network_state().is_online() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    manager.shutdown().await;

    assert!(!manager.network_state().is_online());
    assert!(!transport.probes().is_empty());
  }

  #[tokio::test]
  async fn test_start_is_idempotent_and_shutdown_stops() {
    let (manager, transport) = manager(60_000, 20).await;
    manager.start();
    manager.start();
    assert!(manager.is_running());

    manager.shutdown().await;
    assert!(!manager.is_running());

    let probes = transport.probes().len();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(transport.probes().len(), probes);
  }
}
