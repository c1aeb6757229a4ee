//! Network layer configuration.
//!
//! Every timeout/bound the retry and dedup machinery uses lives here so
//! deployments (and tests, with much smaller horizons) can tune them.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_net_types::ListenOptions;

/// Configuration for [`NetworkService`](crate::NetworkService) and the
/// per-peer reliability machinery.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Overlay keepalive probe interval.
    pub keepalive_interval: Duration,
    /// Overlay keepalive silence budget before a peer is unreachable.
    pub keepalive_timeout: Duration,
    /// Optional proxy address to register through on start.
    pub proxy: Option<String>,
    /// Overlay network id tag.
    pub network_id: u32,

    /// Timeout for synchronous requests.
    pub request_timeout: Duration,
    /// Maximum retry attempts per queued message before it fails
    /// terminally.
    pub max_retries: u32,
    /// Retry loop tick interval.
    pub retry_tick: Duration,
    /// How many eligible messages one tick may advance. The historical
    /// behavior is one per tick; raise only if fan-out peers measurably
    /// starve.
    pub retry_burst: usize,
    /// Grace window after a send attempt during which the entry is not
    /// retried again.
    pub retry_grace: Duration,
    /// How long a peer with queued messages waits for a reconnect before
    /// failing its whole queue.
    pub reconnect_timeout: Duration,
    /// Poll interval while waiting for a reconnect.
    pub reconnect_poll: Duration,

    /// Poll interval for `connect_and_wait`.
    pub connect_poll: Duration,
    /// Connect wait used by broadcast for not-yet-active targets.
    pub broadcast_connect_timeout: Duration,
    /// Upper bound on concurrent broadcast workers.
    pub broadcast_pool: usize,

    /// Capacity of the per-peer inbound dedup cache.
    pub dedup_cache_size: usize,
    /// Retained throughput samples per session direction.
    pub sample_ring_size: usize,
    /// Session throughput sampling interval.
    pub sample_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(15),
            keepalive_timeout: Duration::from_secs(45),
            proxy: None,
            network_id: 1,
            request_timeout: Duration::from_secs(15),
            max_retries: 3,
            retry_tick: Duration::from_secs(1),
            retry_burst: 1,
            retry_grace: Duration::from_millis(500),
            reconnect_timeout: Duration::from_secs(20),
            reconnect_poll: Duration::from_millis(250),
            connect_poll: Duration::from_secs(1),
            broadcast_connect_timeout: Duration::from_secs(10),
            broadcast_pool: 8,
            dedup_cache_size: 1024,
            sample_ring_size: 16,
            sample_interval: Duration::from_secs(1),
        }
    }
}

impl NetworkConfig {
    /// Listen options derived from this config.
    pub fn listen_options(&self) -> ListenOptions {
        ListenOptions {
            keepalive_interval: self.keepalive_interval,
            keepalive_timeout: self.keepalive_timeout,
            proxy: self.proxy.clone(),
            network_id: self.network_id,
        }
    }
}
