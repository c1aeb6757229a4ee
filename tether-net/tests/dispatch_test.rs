//! Inbound dispatch: dedup idempotence, unknown kinds, reply routing,
//! handler panic containment.

mod common;

use bytes::Bytes;
use common::{wait_until, TestPair, A, B};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_net_types::{MessageKind, OverlayClient, Payload};

#[tokio::test]
async fn duplicate_inbound_message_is_handled_once() {
    let pair = TestPair::connected().await;
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = hits.clone();
    pair.b.dispatcher().register_fn(MessageKind::Channel, move |_env| {
        let counted = counted.clone();
        async move {
            counted.fetch_add(1, Ordering::SeqCst);
        }
    });

    // Drive the raw client directly, as a retrying sender would.
    let client = pair.a.ensure_peer(B).client().expect("client");
    for _ in 0..2 {
        client
            .send_with_ack("dup-1", None, Payload::channel(Bytes::from_static(b"x")))
            .await
            .expect("raw send");
    }

    wait_until(Duration::from_secs(1), || hits.load(Ordering::SeqCst) >= 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1, "duplicate must be suppressed");
}

#[tokio::test]
async fn unknown_kind_is_dropped_not_fatal() {
    let pair = TestPair::connected().await;
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = hits.clone();
    // Only Channel is registered; Transfer has no handler.
    pair.b.dispatcher().register_fn(MessageKind::Channel, move |_env| {
        let counted = counted.clone();
        async move {
            counted.fetch_add(1, Ordering::SeqCst);
        }
    });

    pair.a
        .send(B, Payload::transfer(Bytes::from_static(b"nobody-home")))
        .await
        .expect("transport delivery still succeeds");
    pair.a
        .send(B, Payload::channel(Bytes::from_static(b"hello")))
        .await
        .expect("send");

    wait_until(Duration::from_secs(1), || hits.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn stray_reply_is_dropped_defensively() {
    let pair = TestPair::connected().await;
    let client = pair.a.ensure_peer(B).client().expect("client");
    client
        .send_with_ack(
            "r-1",
            Some("no-such-request"),
            Payload::channel(Bytes::from_static(b"late reply")),
        )
        .await
        .expect("raw send");

    wait_until(Duration::from_secs(1), || {
        pair.b
            .peer_snapshot(A)
            .map(|s| s.failed.recv >= 1)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn handler_panic_does_not_kill_the_inbound_pump() {
    let pair = TestPair::connected().await;
    pair.b.dispatcher().register_fn(MessageKind::Channel, |_env| async {
        panic!("handler bug");
    });
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = hits.clone();
    pair.b.dispatcher().register_fn(MessageKind::Transfer, move |_env| {
        let counted = counted.clone();
        async move {
            counted.fetch_add(1, Ordering::SeqCst);
        }
    });

    pair.a
        .send(B, Payload::channel(Bytes::from_static(b"boom")))
        .await
        .expect("send");
    pair.a
        .send(B, Payload::transfer(Bytes::from_static(b"after")))
        .await
        .expect("send after panic");

    wait_until(Duration::from_secs(1), || hits.load(Ordering::SeqCst) == 1).await;
}
