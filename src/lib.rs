//! Multi-tier client cache with offline request queueing and replay.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod db;
pub mod logging;
pub mod net;
pub mod offline;

pub use cache::{CacheManager, CacheOptions, TierKind};
pub use config::Config;
pub use net::{HttpMethod, HttpTransport, RequestOptions, Transport};
pub use offline::{NetworkStatus, OfflineManager, RequestKind};
