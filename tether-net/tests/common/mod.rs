// Each integration test compiles as a separate binary that includes this module via `mod common;`.
// Not every test binary uses every helper, so Rust emits spurious dead_code warnings.
#![allow(dead_code)]
//! Shared test utilities for tether-net integration tests.

use std::sync::Arc;
use std::time::Duration;
use tether_net::{NetworkConfig, NetworkService};
use tether_net_sim::{SimNetwork, SimTransport};

pub const A: &str = "node-a";
pub const B: &str = "node-b";
pub const C: &str = "node-c";
pub const D: &str = "node-d";

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Millisecond-scale horizons so the retry/reconnect paths run in test
/// time instead of wall-clock seconds.
pub fn fast_config() -> NetworkConfig {
    NetworkConfig {
        request_timeout: Duration::from_millis(300),
        max_retries: 3,
        retry_tick: Duration::from_millis(50),
        retry_grace: Duration::from_millis(20),
        reconnect_timeout: Duration::from_millis(600),
        reconnect_poll: Duration::from_millis(20),
        connect_poll: Duration::from_millis(25),
        broadcast_connect_timeout: Duration::from_millis(400),
        broadcast_pool: 4,
        dedup_cache_size: 64,
        sample_ring_size: 8,
        sample_interval: Duration::from_millis(50),
        ..NetworkConfig::default()
    }
}

pub async fn start_node(net: &SimNetwork, name: &str) -> Arc<NetworkService<SimTransport>> {
    start_node_with(net, name, fast_config()).await
}

pub async fn start_node_with(
    net: &SimNetwork,
    name: &str,
    config: NetworkConfig,
) -> Arc<NetworkService<SimTransport>> {
    init_tracing();
    let transport = SimTransport::new(name, net);
    let service = NetworkService::new(transport, config);
    service.start(name).await.expect("service start");
    service
}

/// Two sim-backed nodes, optionally pre-connected.
pub struct TestPair {
    pub net: SimNetwork,
    pub a: Arc<NetworkService<SimTransport>>,
    pub b: Arc<NetworkService<SimTransport>>,
}

impl TestPair {
    pub async fn new() -> Self {
        let net = SimNetwork::new();
        let a = start_node(&net, A).await;
        let b = start_node(&net, B).await;
        Self { net, a, b }
    }

    /// Pair with an established a<->b connection on both sides.
    pub async fn connected() -> Self {
        let pair = Self::new().await;
        pair.a
            .connect_and_wait(B, Duration::from_secs(2))
            .await
            .expect("connect a->b");
        // Let both connection pumps attach their clients.
        wait_until(Duration::from_secs(1), || {
            pair.a.peer(B).and_then(|p| p.client()).is_some()
                && pair.b.peer(A).and_then(|p| p.client()).is_some()
        })
        .await;
        pair
    }
}

/// Poll `cond` until it holds or `timeout` elapses; panics on timeout.
pub async fn wait_until(timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
