//! Offline request handling: queueing writes, replaying them on reconnect and
//! serving reads from cache while the network is down.

mod manager;
mod queue;
mod worker;

pub use manager::{is_offline_capable, offline_key, NetworkStatus, OfflineManager, ESSENTIAL_RESOURCES};
pub use queue::{
  DrainReport, QueueItem, QueueLimits, RequestKind, RequestQueue, QUEUE_MAX_AGE, QUEUE_STORAGE_KEY,
};
