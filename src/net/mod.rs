//! Network access and connectivity tracking.

mod monitor;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use monitor::{ConnectivityEvent, NetworkMonitor, NetworkState, Subscription};
pub use transport::{HttpMethod, HttpTransport, OutboundRequest, RequestOptions, Transport};
