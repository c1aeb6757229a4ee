//! Broadcast fan-out: full completion, reply collection, early stop.

mod common;

use bytes::Bytes;
use common::{start_node, TestPair, A, B, C, D};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tether_net::StopPredicate;
use tether_net_sim::SimNetwork;
use tether_net_types::Payload;

#[tokio::test]
async fn broadcast_reaches_every_address() {
    let net = SimNetwork::new();
    let a = start_node(&net, A).await;
    let _b = start_node(&net, B).await;
    let _c = start_node(&net, C).await;
    let _d = start_node(&net, D).await;

    let targets: Vec<String> = [B, C, D].iter().map(|s| s.to_string()).collect();
    let results = a
        .broadcast(
            &targets,
            Payload::channel(Bytes::from_static(b"fanout")),
            false,
            None,
            None,
        )
        .await
        .expect("broadcast");

    assert_eq!(results.len(), 3);
    for (addr, err) in &results {
        assert!(err.is_none(), "{} failed: {:?}", addr, err);
    }
}

#[tokio::test]
async fn broadcast_collects_replies_per_address() {
    let net = SimNetwork::new();
    let a = start_node(&net, A).await;
    let b = start_node(&net, B).await;
    let c = start_node(&net, C).await;
    b.transport().set_responder(|_| Bytes::from_static(b"from-b"));
    c.transport().set_responder(|_| Bytes::from_static(b"from-c"));

    let replies: Arc<Mutex<HashMap<String, Bytes>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = replies.clone();
    let on_reply: tether_net::ReplyCallback = Arc::new(move |addr: &str, body: Bytes| {
        sink.lock().unwrap().insert(addr.to_string(), body);
    });

    let targets: Vec<String> = [B, C].iter().map(|s| s.to_string()).collect();
    let results = a
        .broadcast(
            &targets,
            Payload::channel(Bytes::from_static(b"who")),
            true,
            None,
            Some(on_reply),
        )
        .await
        .expect("broadcast");

    assert_eq!(results.len(), 2);
    let replies = replies.lock().unwrap();
    assert_eq!(replies.get(B), Some(&Bytes::from_static(b"from-b")));
    assert_eq!(replies.get(C), Some(&Bytes::from_static(b"from-c")));
}

#[tokio::test]
async fn broadcast_returns_early_when_stop_fires() {
    let pair = TestPair::new().await;
    // One fast target and one that can never connect.
    let targets: Vec<String> = vec![B.to_string(), "ghost".to_string()];

    let stop_flag = Arc::new(AtomicBool::new(false));
    let flag = stop_flag.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        flag.store(true, Ordering::SeqCst);
    });
    let stop: StopPredicate = {
        let flag = stop_flag.clone();
        Arc::new(move || flag.load(Ordering::SeqCst))
    };

    let start = Instant::now();
    let results = pair
        .a
        .broadcast(
            &targets,
            Payload::channel(Bytes::from_static(b"x")),
            false,
            Some(stop),
            None,
        )
        .await
        .expect("broadcast");
    let elapsed = start.elapsed();

    // The ghost target alone would block for the 400ms connect wait;
    // the stop predicate must cut the collection short within one
    // dispatch cycle of firing.
    assert!(elapsed < Duration::from_millis(390), "took {:?}", elapsed);
    assert!(
        matches!(results.get(B), Some(None)),
        "fast target completed first: {:?}",
        results
    );
    assert!(!results.contains_key("ghost"));
}
