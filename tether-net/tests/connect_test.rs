//! Connection management: fast paths, probe dedup, wait timeouts,
//! disconnect semantics, shutdown.

mod common;

use bytes::Bytes;
use common::{start_node, wait_until, TestPair, A, B, C};
use std::time::Duration;
use tether_net::{NetError, SendOptions};
use tether_net_types::{Payload, PeerState};

#[tokio::test]
async fn reconnect_fast_path_skips_the_transport() {
    let pair = TestPair::connected().await;
    assert_eq!(pair.a.transport().bootstrap_calls(), 1);

    let mut events = pair.a.subscribe_peer_events();
    pair.a.connect(B).await.expect("fast-path connect");

    // An immediate synthesized reachable signal, no new bootstrap.
    let event = tokio::time::timeout(Duration::from_millis(200), events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(event.address, B);
    assert_eq!(event.state, PeerState::Reachable);
    assert_eq!(pair.a.transport().bootstrap_calls(), 1);
}

#[tokio::test]
async fn outstanding_probe_suppresses_repeat_bootstraps() {
    let net = tether_net_sim::SimNetwork::new();
    let a = start_node(&net, A).await;
    let c = start_node(&net, C).await;
    // c refuses bootstraps, so the probe stays outstanding.
    c.transport().faults().set_refuse_bootstrap(true);

    a.connect(C).await.expect("first connect");
    a.connect(C).await.expect("second connect is a no-op");
    assert_eq!(a.transport().bootstrap_calls(), 1);
}

#[tokio::test]
async fn connect_and_wait_times_out_on_unreachable_peer() {
    let net = tether_net_sim::SimNetwork::new();
    let a = start_node(&net, A).await;
    let c = start_node(&net, C).await;
    c.transport().faults().set_refuse_bootstrap(true);

    let err = a
        .connect_and_wait(C, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::WaitTimeout(addr) if addr == C));
}

#[tokio::test]
async fn empty_address_is_rejected() {
    let pair = TestPair::new().await;
    let err = pair.a.connect("").await.unwrap_err();
    assert!(matches!(err, NetError::InvalidAddress(_)));
}

#[tokio::test]
async fn disconnect_without_client_errors() {
    let pair = TestPair::new().await;
    let err = pair.a.disconnect(B).await.unwrap_err();
    assert!(matches!(err, NetError::NoClient(addr) if addr == B));
}

#[tokio::test]
async fn disconnect_drops_the_connection_on_both_sides() {
    let pair = TestPair::connected().await;
    assert!(pair.a.is_connection_exists(B));

    pair.a.disconnect(B).await.expect("disconnect");

    wait_until(Duration::from_secs(1), || {
        !pair.a.is_active(B) && !pair.a.is_connection_exists(B)
    })
    .await;
    wait_until(Duration::from_secs(1), || !pair.b.is_active(A)).await;
}

#[tokio::test]
async fn shutdown_completes_pending_sends_with_teardown_error() {
    let pair = TestPair::new().await;
    let peer = pair.a.ensure_peer("ghost");
    let sender = peer.clone();
    let pending = tokio::spawn(async move {
        sender
            .send(
                None,
                Payload::channel(Bytes::from_static(b"x")),
                SendOptions::default(),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    pair.a.shutdown().await;

    let outcome = tokio::time::timeout(Duration::from_millis(200), pending)
        .await
        .expect("send completed by shutdown")
        .expect("join");
    assert!(matches!(outcome, Err(NetError::PeerTornDown(_))));
}
