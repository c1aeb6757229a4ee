//! NetworkService - the public messaging surface.
//!
//! Owns the overlay handle, the ActivePeers registry and the per-peer
//! reliability machinery, and translates overlay lifecycle events into
//! Peer state. Generic over `T: OverlayTransport`: production binds the
//! real overlay, tests bind the in-memory sim transport.

use crate::config::NetworkConfig;
use crate::dispatch::Dispatcher;
use crate::error::NetError;
use crate::peer::{Peer, PeerSnapshot, SendOptions};
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tether_net_types::{
    ConnectionEvent, Envelope, OverlayClient, OverlayTransport, Payload, PeerState, PeerStateEvent,
    TransportError,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One dispatch cycle: how often broadcast re-evaluates its stop
/// predicate while results are pending.
const BROADCAST_STOP_POLL: Duration = Duration::from_millis(100);

/// Broadcast early-exit predicate.
pub type StopPredicate = Arc<dyn Fn() -> bool + Send + Sync>;
/// Per-reply callback for broadcast requests: `(address, reply body)`.
pub type ReplyCallback = Arc<dyn Fn(&str, Bytes) + Send + Sync>;

/// Central service for peer messaging.
pub struct NetworkService<T: OverlayTransport> {
    transport: Arc<T>,
    config: NetworkConfig,
    peers: RwLock<HashMap<String, Arc<Peer<T::Client>>>>,
    /// Addresses the overlay currently reports reachable.
    active: RwLock<HashSet<String>>,
    /// Addresses with an outstanding health-check probe.
    probes: RwLock<HashSet<String>>,
    peer_event_tx: broadcast::Sender<PeerStateEvent>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl<T: OverlayTransport> NetworkService<T> {
    pub fn new(transport: T, config: NetworkConfig) -> Arc<Self> {
        let (peer_event_tx, _) = broadcast::channel(128);
        Arc::new(Self {
            transport: Arc::new(transport),
            config,
            peers: RwLock::new(HashMap::new()),
            active: RwLock::new(HashSet::new()),
            probes: RwLock::new(HashSet::new()),
            peer_event_tx,
            dispatcher: Arc::new(Dispatcher::new()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Registration point for inbound-message handlers by kind.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Reachability-change notifications (drives channel-health and
    /// similar upstream logic).
    pub fn subscribe_peer_events(&self) -> broadcast::Receiver<PeerStateEvent> {
        self.peer_event_tx.subscribe()
    }

    // ==================== Lifecycle ====================

    /// Start the overlay listener and the event pumps. Returns once the
    /// transport is actively listening (and proxy registration has
    /// completed, when configured).
    #[tracing::instrument(skip(self))]
    pub async fn start(self: &Arc<Self>, listen_addr: &str) -> Result<(), NetError> {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("Network service already started");
            return Ok(());
        }
        self.transport
            .listen(listen_addr, self.config.listen_options())
            .await?;
        self.spawn_peer_state_pump();
        self.spawn_connection_pump();
        self.spawn_inbound_pump();
        tracing::info!(addr = %listen_addr, "Network service started");
        Ok(())
    }

    /// Stop the pumps and tear every peer down. Queued messages complete
    /// with a teardown error; nothing is silently abandoned.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let peers: Vec<_> = self
            .peers
            .read()
            .expect("peers lock")
            .values()
            .cloned()
            .collect();
        for peer in peers {
            peer.teardown().await;
        }
        tracing::info!("Network service stopped");
    }

    // ==================== Connection management ====================

    /// Work toward a connection with `addr`. Idempotent fast path: an
    /// already-active address yields an immediate reachable signal
    /// without touching the transport; an outstanding probe makes this
    /// a no-op. Non-blocking.
    pub async fn connect(&self, addr: &str) -> Result<(), NetError> {
        if addr.is_empty() {
            return Err(NetError::InvalidAddress(addr.to_string()));
        }
        if self.is_active(addr) {
            let _ = self.peer_event_tx.send(PeerStateEvent {
                address: addr.to_string(),
                state: PeerState::Reachable,
            });
            return Ok(());
        }
        {
            let mut probes = self.probes.write().expect("probes lock");
            if !probes.insert(addr.to_string()) {
                tracing::debug!(peer = %addr, "Health check already outstanding");
                return Ok(());
            }
        }
        if let Some(peer) = self.peer(addr) {
            peer.mark_connecting();
        }
        tracing::debug!(peer = %addr, "Bootstrapping toward peer");
        self.transport.bootstrap(addr).await;
        Ok(())
    }

    /// As [`connect`](Self::connect), then poll ActivePeers until the
    /// peer is reachable or `timeout` elapses.
    pub async fn connect_and_wait(&self, addr: &str, timeout: Duration) -> Result<(), NetError> {
        self.connect(addr).await?;
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_active(addr) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(NetError::WaitTimeout(addr.to_string()));
            }
            tokio::time::sleep(self.config.connect_poll.min(deadline - now)).await;
        }
    }

    /// Close the client for `addr` and clear any outstanding probe.
    /// Fails when no client exists.
    pub async fn disconnect(&self, addr: &str) -> Result<(), NetError> {
        self.probes.write().expect("probes lock").remove(addr);
        let client = self.peer(addr).and_then(|p| p.client());
        match client {
            Some(client) => {
                client.close().await?;
                Ok(())
            }
            None => Err(NetError::NoClient(addr.to_string())),
        }
    }

    /// As [`disconnect`](Self::disconnect), additionally marking the
    /// peer explicitly closed.
    pub async fn close(&self, addr: &str) -> Result<(), NetError> {
        self.disconnect(addr).await?;
        if let Some(peer) = self.peer(addr) {
            peer.mark_closed();
        }
        Ok(())
    }

    pub fn is_connection_exists(&self, addr: &str) -> bool {
        self.transport.connection_state_exists(addr)
    }

    pub fn is_active(&self, addr: &str) -> bool {
        self.active.read().expect("active lock").contains(addr)
    }

    /// Addresses currently considered reachable.
    pub fn active_peers(&self) -> Vec<String> {
        self.active
            .read()
            .expect("active lock")
            .iter()
            .cloned()
            .collect()
    }

    // ==================== Messaging ====================

    /// Reliable fire-and-forget send: fails immediately for an inactive
    /// peer, otherwise queues on the Peer and blocks until a terminal
    /// outcome (ACK, or retry/reconnect budget exhausted).
    pub async fn send(&self, addr: &str, payload: Payload) -> Result<(), NetError> {
        self.send_message(addr, None, payload, SendOptions::default())
            .await
    }

    /// General form of [`send`](Self::send) with an explicit message id
    /// and send options.
    pub async fn send_message(
        &self,
        addr: &str,
        id: Option<String>,
        payload: Payload,
        opts: SendOptions,
    ) -> Result<(), NetError> {
        if !self.is_active(addr) {
            return Err(NetError::PeerInactive(addr.to_string()));
        }
        let peer = self.ensure_peer(addr);
        self.attach_client_if_needed(&peer).await;
        peer.send(id, payload, opts).await
    }

    /// Synchronous request/reply over the transport with the configured
    /// request timeout. Fails with a no-client error when no connection
    /// exists.
    pub async fn request(&self, addr: &str, payload: Payload) -> Result<Bytes, NetError> {
        let client = match self.peer(addr).and_then(|p| p.client()) {
            Some(client) => client,
            None => {
                if !self.transport.connection_state_exists(addr) {
                    return Err(NetError::NoClient(addr.to_string()));
                }
                self.transport
                    .dial(addr)
                    .await
                    .map_err(|_| NetError::NoClient(addr.to_string()))?
            }
        };
        match client.request(payload, self.config.request_timeout).await {
            Ok(body) => Ok(body),
            Err(TransportError::Timeout) => Err(NetError::RequestTimeout(addr.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Repeat [`request`](Self::request) up to `retries` times, stopping
    /// early on any error other than a request timeout.
    pub async fn request_with_retry(
        &self,
        addr: &str,
        payload: Payload,
        retries: u32,
    ) -> Result<Bytes, NetError> {
        let attempts = retries.max(1);
        let mut last = NetError::RequestTimeout(addr.to_string());
        for attempt in 0..attempts {
            match self.request(addr, payload.clone()).await {
                Ok(body) => return Ok(body),
                Err(NetError::RequestTimeout(a)) => {
                    tracing::debug!(peer = %addr, attempt, "Request timed out, retrying");
                    last = NetError::RequestTimeout(a);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Send an application-level reply correlated to an earlier inbound
    /// message. Replies are direct writes: the requester's own retry
    /// machinery covers loss.
    pub async fn reply(
        &self,
        addr: &str,
        orig_id: &str,
        payload: Payload,
    ) -> Result<(), NetError> {
        let client = self
            .peer(addr)
            .and_then(|p| p.client())
            .ok_or_else(|| NetError::NoClient(addr.to_string()))?;
        let msg_id = Uuid::new_v4().to_string();
        client
            .send_with_ack(&msg_id, Some(orig_id), payload)
            .await?;
        Ok(())
    }

    /// Fan one logical message out to many addresses with a bounded
    /// worker pool. Per address: connect-if-needed, then send (or
    /// request when `need_reply`). `on_reply` runs per successful reply;
    /// the result map holds one entry per completed address (None =
    /// success). Returns early once `stop()` reports true; dropping the
    /// in-flight workers cancels them, so nothing leaks.
    #[tracing::instrument(skip(self, payload, stop, on_reply), fields(count = addresses.len()))]
    pub async fn broadcast(
        &self,
        addresses: &[String],
        payload: Payload,
        need_reply: bool,
        stop: Option<StopPredicate>,
        on_reply: Option<ReplyCallback>,
    ) -> Result<HashMap<String, Option<NetError>>, NetError> {
        let mut results: HashMap<String, Option<NetError>> = HashMap::new();
        if addresses.is_empty() {
            return Ok(results);
        }
        let pool = self.config.broadcast_pool.min(addresses.len()).max(1);
        let mut workers = futures_util::stream::iter(addresses.iter().cloned().map(|addr| {
            let payload = payload.clone();
            async move {
                let result = self.broadcast_one(&addr, payload, need_reply).await;
                (addr, result)
            }
        }))
        .buffer_unordered(pool);

        let stopped = || stop.as_ref().map(|s| s()).unwrap_or(false);
        let has_stop = stop.is_some();
        loop {
            if stopped() {
                tracing::debug!(collected = results.len(), "Broadcast stopped early");
                break;
            }
            tokio::select! {
                item = workers.next() => {
                    let Some((addr, result)) = item else { break };
                    match result {
                        Ok(reply) => {
                            if let (Some(on_reply), Some(body)) = (&on_reply, reply) {
                                on_reply(&addr, body);
                            }
                            results.insert(addr, None);
                        }
                        Err(e) => {
                            tracing::debug!(peer = %addr, error = %e, "Broadcast target failed");
                            results.insert(addr, Some(e));
                        }
                    }
                }
                _ = tokio::time::sleep(BROADCAST_STOP_POLL), if has_stop => {}
            }
        }
        Ok(results)
    }

    async fn broadcast_one(
        &self,
        addr: &str,
        payload: Payload,
        need_reply: bool,
    ) -> Result<Option<Bytes>, NetError> {
        if !self.is_active(addr) {
            self.connect_and_wait(addr, self.config.broadcast_connect_timeout)
                .await?;
        }
        if need_reply {
            self.request(addr, payload).await.map(Some)
        } else {
            self.send(addr, payload).await.map(|_| None)
        }
    }

    // ==================== Peer registry ====================

    pub fn peer(&self, addr: &str) -> Option<Arc<Peer<T::Client>>> {
        self.peers.read().expect("peers lock").get(addr).cloned()
    }

    /// Get or lazily create the Peer for `addr`. Exactly one instance
    /// per address.
    pub fn ensure_peer(&self, addr: &str) -> Arc<Peer<T::Client>> {
        if let Some(peer) = self.peer(addr) {
            return peer;
        }
        let mut peers = self.peers.write().expect("peers lock");
        peers
            .entry(addr.to_string())
            .or_insert_with(|| Peer::new(addr, self.config.clone()))
            .clone()
    }

    pub fn peer_snapshot(&self, addr: &str) -> Option<PeerSnapshot> {
        self.peer(addr).map(|p| p.snapshot())
    }

    /// Attach an outbound client when the overlay holds a connection
    /// state for the peer but no connect event delivered a client yet
    /// (we initiated the bootstrap).
    async fn attach_client_if_needed(&self, peer: &Arc<Peer<T::Client>>) {
        if peer.client().is_some() {
            return;
        }
        let addr = peer.address().to_string();
        if !self.transport.connection_state_exists(&addr) {
            return;
        }
        match self.transport.dial(&addr).await {
            Ok(client) => peer.set_client(client),
            Err(e) => {
                peer.failed().record_dial();
                tracing::debug!(peer = %addr, error = %e, "Dial failed");
            }
        }
    }

    // ==================== Event pumps ====================

    fn spawn_peer_state_pump(self: &Arc<Self>) {
        let service = self.clone();
        let mut events = self.transport.peer_events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = service.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => service.handle_peer_state(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Peer-state stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    fn handle_peer_state(&self, event: PeerStateEvent) {
        match event.state {
            PeerState::Reachable => {
                self.active
                    .write()
                    .expect("active lock")
                    .insert(event.address.clone());
                self.probes
                    .write()
                    .expect("probes lock")
                    .remove(&event.address);
                tracing::debug!(peer = %event.address, "Peer reachable");
            }
            PeerState::Unreachable => {
                self.active
                    .write()
                    .expect("active lock")
                    .remove(&event.address);
                tracing::debug!(peer = %event.address, "Peer unreachable");
            }
            PeerState::Unknown => {
                tracing::trace!(peer = %event.address, "Peer state unknown");
            }
        }
        let _ = self.peer_event_tx.send(event);
    }

    fn spawn_connection_pump(self: &Arc<Self>) {
        let service = self.clone();
        let mut events = self.transport.connection_events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = service.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => service.handle_connection_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Connection stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    async fn handle_connection_event(&self, event: ConnectionEvent<T::Client>) {
        match event {
            ConnectionEvent::Connected {
                address,
                peer_id,
                client,
            } => {
                if self.config.proxy.as_deref() == Some(address.as_str()) {
                    tracing::debug!(addr = %address, "Proxy connection, not an application peer");
                    return;
                }
                match self.transport.wallet_address(&peer_id) {
                    Ok(key) => {
                        let peer = self.ensure_peer(&key);
                        peer.set_client(client);
                    }
                    Err(e) => {
                        tracing::debug!(peer_id = %peer_id, error = %e, "Ignoring connect event with unparseable peer id");
                    }
                }
            }
            ConnectionEvent::Disconnected { peer_id, .. } => {
                match self.transport.wallet_address(&peer_id) {
                    Ok(key) => {
                        if let Some(peer) = self.peer(&key) {
                            peer.notify_disconnected().await;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(peer_id = %peer_id, error = %e, "Ignoring disconnect event with unparseable peer id");
                    }
                }
            }
        }
    }

    fn spawn_inbound_pump(self: &Arc<Self>) {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = service.cancel.cancelled() => break,
                    envelope = service.transport.next_inbound() => match envelope {
                        Some(envelope) => service.handle_inbound(envelope).await,
                        None => break,
                    }
                }
            }
        });
    }

    async fn handle_inbound(&self, envelope: Envelope) {
        let key = match self.transport.wallet_address(&envelope.from_peer_id) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(peer_id = %envelope.from_peer_id, error = %e, "Ignoring inbound with unparseable peer id");
                return;
            }
        };
        let peer = self.ensure_peer(&key);

        if let Some(session_id) = &envelope.session_id {
            peer.record_rx(session_id, envelope.payload.body.len() as u64);
        }

        // Replies route to the pending request, bypassing dispatch.
        if let Some(orig_id) = &envelope.reply_to {
            if !peer.receive(orig_id, envelope.payload.body.clone()) {
                peer.failed().record_recv();
                tracing::debug!(peer = %key, orig = %orig_id, "Reply with no pending request, dropping");
            }
            return;
        }

        if !peer.mark_received(&envelope.msg_id) {
            tracing::debug!(peer = %key, msg = %envelope.msg_id, "Duplicate inbound message suppressed");
            return;
        }
        // Handlers run on their own task so a slow or blocking handler
        // (one that itself waits on a reply) cannot stall the pump.
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(envelope).await;
        });
    }
}
