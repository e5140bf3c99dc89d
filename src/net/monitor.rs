//! Online/offline tracking.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::info;

use super::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
  Online,
  Offline,
}

impl NetworkState {
  pub fn from_online(online: bool) -> Self {
    if online {
      NetworkState::Online
    } else {
      NetworkState::Offline
    }
  }

  pub fn is_online(self) -> bool {
    self == NetworkState::Online
  }
}

/// Connectivity change reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  WentOffline,
  CameOnline,
}

type Listener = Arc<dyn Fn(bool) + Send + Sync>;
type Listeners = Mutex<BTreeMap<u64, Listener>>;

/// Handle returned by [`NetworkMonitor::on_change`].
///
/// The callback stays registered until the handle is dropped or
/// [`Subscription::unsubscribe`] is called.
#[must_use = "dropping the subscription unsubscribes the callback"]
pub struct Subscription {
  id: u64,
  listeners: Weak<Listeners>,
}

impl Subscription {
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(listeners) = self.listeners.upgrade() {
      listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&self.id);
    }
  }
}

/// Tracks connectivity from platform events and an active probe.
///
/// The monitor does not drain anything itself: the event and probe handlers
/// return `true` when the owner should replay queued requests.
pub struct NetworkMonitor {
  online: AtomicBool,
  listeners: Arc<Listeners>,
  next_id: AtomicU64,
  transport: Arc<dyn Transport>,
  probe_url: String,
}

impl NetworkMonitor {
  pub fn new(transport: Arc<dyn Transport>, probe_url: impl Into<String>, initially_online: bool) -> Self {
    Self {
      online: AtomicBool::new(initially_online),
      listeners: Arc::new(Mutex::new(BTreeMap::new())),
      next_id: AtomicU64::new(0),
      transport,
      probe_url: probe_url.into(),
    }
  }

  pub fn state(&self) -> NetworkState {
    NetworkState::from_online(self.is_online())
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Register `callback` for state changes; it receives the new online flag.
  pub fn on_change<F>(&self, callback: F) -> Subscription
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(id, Arc::new(callback));

    Subscription {
      id,
      listeners: Arc::downgrade(&self.listeners),
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  /// Apply a platform event. Subscribers are always notified; returns whether
  /// a drain should follow.
  pub fn handle_event(&self, event: ConnectivityEvent) -> bool {
    match event {
      ConnectivityEvent::WentOffline => {
        info!("Network connection lost");
        self.online.store(false, Ordering::SeqCst);
        self.notify(false);
        false
      }
      ConnectivityEvent::CameOnline => {
        info!("Network connection restored");
        self.online.store(true, Ordering::SeqCst);
        self.notify(true);
        true
      }
    }
  }

  /// Run one liveness probe. Subscribers hear about real transitions only;
  /// returns true on an offline to online transition.
  pub async fn probe(&self) -> bool {
    let reachable = self.transport.probe(&self.probe_url).await;
    let was_online = self.online.swap(reachable, Ordering::SeqCst);

    if was_online == reachable {
      return false;
    }

    info!(online = reachable, "Connectivity changed (probe)");
    self.notify(reachable);
    reachable
  }

  fn notify(&self, online: bool) {
    // Call outside the lock so callbacks may subscribe or unsubscribe
    let listeners: Vec<Listener> = self
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .cloned()
      .collect();

    for listener in listeners {
      listener(online);
    }
  }
}
