//! SimTransport — in-memory OverlayTransport implementation
//!
//! A shared `SimNetwork` broker routes envelopes between per-node
//! `SimTransport` instances. Links are symmetric client pairs; events
//! (reachability, connection lifecycle, ACK status) flow through the
//! same broadcast channels the production overlay binding uses.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tether_net_types::{
    AckEvent, AckStatus, ConnectionEvent, Envelope, ListenOptions, OverlayClient,
    OverlayTransport, Payload, PeerState, PeerStateEvent, TransportError,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

type Responder = Arc<dyn Fn(Payload) -> Bytes + Send + Sync>;

/// Injectable fault switches for one node's outbound traffic.
#[derive(Default)]
pub struct Faults {
    refuse_bootstrap: AtomicBool,
    blackhole: AtomicBool,
    nack: AtomicBool,
    stall_streams: AtomicBool,
    request_delay: Mutex<Option<Duration>>,
}

impl Faults {
    /// Bootstraps toward (or from) this node never establish a link.
    pub fn set_refuse_bootstrap(&self, on: bool) {
        self.refuse_bootstrap.store(on, Ordering::SeqCst);
    }

    /// Outbound sends vanish: no delivery, no ACK at all.
    pub fn set_blackhole(&self, on: bool) {
        self.blackhole.store(on, Ordering::SeqCst);
    }

    /// Outbound sends vanish and report an ACK failure.
    pub fn set_nack(&self, on: bool) {
        self.nack.store(on, Ordering::SeqCst);
    }

    /// Stream writes stall until their stream is closed.
    pub fn set_stall_streams(&self, on: bool) {
        self.stall_streams.store(on, Ordering::SeqCst);
    }

    /// Delay answering requests addressed to this node.
    pub fn set_request_delay(&self, delay: Option<Duration>) {
        *self.request_delay.lock().expect("faults lock") = delay;
    }

    fn refuse_bootstrap(&self) -> bool {
        self.refuse_bootstrap.load(Ordering::SeqCst)
    }

    fn blackhole(&self) -> bool {
        self.blackhole.load(Ordering::SeqCst)
    }

    fn nack(&self) -> bool {
        self.nack.load(Ordering::SeqCst)
    }

    fn stall_streams(&self) -> bool {
        self.stall_streams.load(Ordering::SeqCst)
    }

    fn request_delay(&self) -> Option<Duration> {
        *self.request_delay.lock().expect("faults lock")
    }
}

/// Broker-side handles for one registered node.
#[derive(Clone)]
struct Node {
    inbound_tx: mpsc::Sender<Envelope>,
    peer_events: broadcast::Sender<PeerStateEvent>,
    conn_events: broadcast::Sender<ConnectionEvent<SimClient>>,
    links: Arc<Mutex<HashMap<String, Arc<SimClient>>>>,
    faults: Arc<Faults>,
    responder: Arc<RwLock<Responder>>,
}

/// Shared network broker — routes links and envelopes between
/// `SimTransport` instances.
#[derive(Clone, Default)]
pub struct SimNetwork {
    nodes: Arc<Mutex<HashMap<String, Node>>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, addr: &str) -> Option<Node> {
        self.nodes.lock().expect("nodes lock").get(addr).cloned()
    }

    fn register(&self, addr: &str, node: Node) {
        self.nodes
            .lock()
            .expect("nodes lock")
            .insert(addr.to_string(), node);
    }

    /// Establish a symmetric link between two registered nodes,
    /// emitting connection and reachability events on both sides.
    /// Idempotent for an existing link.
    fn link(&self, a: &str, b: &str) -> Result<(), TransportError> {
        let (node_a, node_b) = {
            let nodes = self.nodes.lock().expect("nodes lock");
            (nodes.get(a).cloned(), nodes.get(b).cloned())
        };
        let (Some(node_a), Some(node_b)) = (node_a, node_b) else {
            return Err(TransportError::Connect(format!(
                "peer not found in network: {} <-> {}",
                a, b
            )));
        };
        if node_a.links.lock().expect("links lock").contains_key(b) {
            return Ok(());
        }

        let client_ab = SimClient::new(a, b, self.clone());
        let client_ba = SimClient::new(b, a, self.clone());
        node_a
            .links
            .lock()
            .expect("links lock")
            .insert(b.to_string(), client_ab.clone());
        node_b
            .links
            .lock()
            .expect("links lock")
            .insert(a.to_string(), client_ba.clone());

        let _ = node_a.conn_events.send(ConnectionEvent::Connected {
            address: b.to_string(),
            peer_id: b.to_string(),
            client: client_ab,
        });
        let _ = node_b.conn_events.send(ConnectionEvent::Connected {
            address: a.to_string(),
            peer_id: a.to_string(),
            client: client_ba,
        });
        let _ = node_a.peer_events.send(PeerStateEvent {
            address: b.to_string(),
            state: PeerState::Reachable,
        });
        let _ = node_b.peer_events.send(PeerStateEvent {
            address: a.to_string(),
            state: PeerState::Reachable,
        });
        Ok(())
    }

    /// Tear a link down: cancel both close signals and emit disconnect
    /// and unreachable events on both sides.
    pub fn sever(&self, a: &str, b: &str) {
        let (node_a, node_b) = {
            let nodes = self.nodes.lock().expect("nodes lock");
            (nodes.get(a).cloned(), nodes.get(b).cloned())
        };
        for (node, remote) in [(node_a, b), (node_b, a)] {
            let Some(node) = node else { continue };
            let client = node.links.lock().expect("links lock").remove(remote);
            if let Some(client) = client {
                client.closed.cancel();
                let _ = node.conn_events.send(ConnectionEvent::Disconnected {
                    address: remote.to_string(),
                    peer_id: remote.to_string(),
                });
                let _ = node.peer_events.send(PeerStateEvent {
                    address: remote.to_string(),
                    state: PeerState::Unreachable,
                });
            }
        }
    }

    async fn deliver(&self, to: &str, envelope: Envelope) -> Result<(), TransportError> {
        let inbound = self
            .node(to)
            .map(|n| n.inbound_tx.clone())
            .ok_or_else(|| TransportError::Send(format!("peer not found: {}", to)))?;
        inbound
            .send(envelope)
            .await
            .map_err(|_| TransportError::Send(format!("inbound queue closed: {}", to)))
    }
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNetwork").finish()
    }
}

struct StreamState {
    bytes: u64,
    stall: CancellationToken,
}

/// One direction of an in-memory link.
pub struct SimClient {
    local: String,
    remote: String,
    network: SimNetwork,
    acks: broadcast::Sender<AckEvent>,
    closed: CancellationToken,
    streams: Mutex<HashMap<String, StreamState>>,
    next_stream: AtomicU64,
}

impl SimClient {
    fn new(local: &str, remote: &str, network: SimNetwork) -> Arc<Self> {
        let (acks, _) = broadcast::channel(256);
        Arc::new(Self {
            local: local.to_string(),
            remote: remote.to_string(),
            network,
            acks,
            closed: CancellationToken::new(),
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(0),
        })
    }

    fn local_faults(&self) -> Option<Arc<Faults>> {
        self.network.node(&self.local).map(|n| n.faults)
    }

    fn emit_ack(&self, msg_id: &str, status: AckStatus) {
        let _ = self.acks.send(AckEvent {
            msg_id: msg_id.to_string(),
            status,
        });
    }

    fn envelope(
        &self,
        msg_id: &str,
        reply_to: Option<&str>,
        session_id: Option<&str>,
        payload: Payload,
    ) -> Envelope {
        Envelope {
            from_address: self.local.clone(),
            from_peer_id: self.local.clone(),
            msg_id: msg_id.to_string(),
            reply_to: reply_to.map(str::to_string),
            session_id: session_id.map(str::to_string),
            payload,
        }
    }
}

impl OverlayClient for SimClient {
    fn remote_address(&self) -> String {
        self.remote.clone()
    }

    fn remote_peer_id(&self) -> String {
        self.remote.clone()
    }

    async fn send_with_ack(
        &self,
        msg_id: &str,
        reply_to: Option<&str>,
        payload: Payload,
    ) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if let Some(faults) = self.local_faults() {
            if faults.blackhole() {
                tracing::debug!(from = %self.local, to = %self.remote, msg = %msg_id, "Blackholed send");
                return Ok(());
            }
            if faults.nack() {
                tracing::debug!(from = %self.local, to = %self.remote, msg = %msg_id, "Nacked send");
                self.emit_ack(msg_id, AckStatus::Failure);
                return Ok(());
            }
        }
        let envelope = self.envelope(msg_id, reply_to, None, payload);
        match self.network.deliver(&self.remote, envelope).await {
            Ok(()) => self.emit_ack(msg_id, AckStatus::Success),
            Err(_) => self.emit_ack(msg_id, AckStatus::Failure),
        }
        Ok(())
    }

    async fn request(
        &self,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let node = self
            .network
            .node(&self.remote)
            .ok_or_else(|| TransportError::Connect(format!("peer not found: {}", self.remote)))?;
        let delay = node.faults.request_delay();
        let responder = node.responder.read().expect("responder lock").clone();
        let respond = async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            responder(payload)
        };
        tokio::time::timeout(timeout, respond)
            .await
            .map_err(|_| TransportError::Timeout)
    }

    async fn open_stream(&self) -> Result<String, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let n = self.next_stream.fetch_add(1, Ordering::SeqCst) + 1;
        let stream_id = format!("{}/{}-{}", self.local, self.remote, n);
        self.streams.lock().expect("streams lock").insert(
            stream_id.clone(),
            StreamState {
                bytes: 0,
                stall: CancellationToken::new(),
            },
        );
        Ok(stream_id)
    }

    async fn close_stream(&self, stream_id: &str) -> Result<(), TransportError> {
        if let Some(state) = self.streams.lock().expect("streams lock").remove(stream_id) {
            state.stall.cancel();
        }
        Ok(())
    }

    async fn stream_send_with_ack(
        &self,
        stream_id: &str,
        session_id: &str,
        msg_id: &str,
        payload: Payload,
    ) -> Result<usize, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let stall = {
            let streams = self.streams.lock().expect("streams lock");
            let Some(state) = streams.get(stream_id) else {
                return Err(TransportError::Stream(format!(
                    "unknown stream: {}",
                    stream_id
                )));
            };
            state.stall.clone()
        };
        let stalling = self
            .local_faults()
            .map(|f| f.stall_streams())
            .unwrap_or(false);
        if stalling {
            // Hangs until close_stream() cancels the write.
            stall.cancelled().await;
            return Err(TransportError::Stream("write cancelled".into()));
        }

        let written = payload.body.len();
        {
            let mut streams = self.streams.lock().expect("streams lock");
            if let Some(state) = streams.get_mut(stream_id) {
                state.bytes += written as u64;
            }
        }
        let envelope = self.envelope(msg_id, None, Some(session_id), payload);
        match self.network.deliver(&self.remote, envelope).await {
            Ok(()) => {
                self.emit_ack(msg_id, AckStatus::Success);
                Ok(written)
            }
            Err(e) => {
                self.emit_ack(msg_id, AckStatus::Failure);
                Err(e)
            }
        }
    }

    fn stream_data_count(&self, stream_id: &str) -> u64 {
        self.streams
            .lock()
            .expect("streams lock")
            .get(stream_id)
            .map(|s| s.bytes)
            .unwrap_or(0)
    }

    fn in_retry_window(&self, _msg_id: &str) -> bool {
        false
    }

    fn ack_events(&self) -> broadcast::Receiver<AckEvent> {
        self.acks.subscribe()
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.network.sever(&self.local, &self.remote);
        Ok(())
    }
}

/// In-memory transport for one node.
pub struct SimTransport {
    address: String,
    network: SimNetwork,
    node: Node,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    listening: AtomicBool,
    bootstrap_calls: AtomicU64,
}

impl SimTransport {
    pub fn new(address: &str, network: &SimNetwork) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (peer_events, _) = broadcast::channel(256);
        let (conn_events, _) = broadcast::channel(256);
        let default_responder: Responder = Arc::new(|payload: Payload| payload.body);
        let node = Node {
            inbound_tx,
            peer_events,
            conn_events,
            links: Arc::new(Mutex::new(HashMap::new())),
            faults: Arc::new(Faults::default()),
            responder: Arc::new(RwLock::new(default_responder)),
        };
        network.register(address, node.clone());
        Self {
            address: address.to_string(),
            network: network.clone(),
            node,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            listening: AtomicBool::new(false),
            bootstrap_calls: AtomicU64::new(0),
        }
    }

    /// Fault switches for this node's outbound traffic.
    pub fn faults(&self) -> &Arc<Faults> {
        &self.node.faults
    }

    /// How many bootstrap calls the messaging layer has issued.
    pub fn bootstrap_calls(&self) -> u64 {
        self.bootstrap_calls.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Install the request responder for this node.
    pub fn set_responder(&self, f: impl Fn(Payload) -> Bytes + Send + Sync + 'static) {
        *self.node.responder.write().expect("responder lock") = Arc::new(f);
    }
}

impl std::fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimTransport")
            .field("address", &self.address)
            .finish()
    }
}

impl OverlayTransport for SimTransport {
    type Client = SimClient;

    fn local_address(&self) -> String {
        self.address.clone()
    }

    async fn listen(&self, _addr: &str, _opts: ListenOptions) -> Result<(), TransportError> {
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn bootstrap(&self, addr: &str) {
        self.bootstrap_calls.fetch_add(1, Ordering::SeqCst);
        let refused = self.node.faults.refuse_bootstrap()
            || self
                .network
                .node(addr)
                .map(|n| n.faults.refuse_bootstrap())
                .unwrap_or(true);
        if refused {
            tracing::debug!(from = %self.address, to = %addr, "Bootstrap found no route");
            return;
        }
        if let Err(e) = self.network.link(&self.address, addr) {
            tracing::debug!(from = %self.address, to = %addr, error = %e, "Bootstrap failed");
        }
    }

    async fn dial(&self, addr: &str) -> Result<Arc<SimClient>, TransportError> {
        if let Some(client) = self.node.links.lock().expect("links lock").get(addr) {
            return Ok(client.clone());
        }
        self.network.link(&self.address, addr)?;
        self.node
            .links
            .lock()
            .expect("links lock")
            .get(addr)
            .cloned()
            .ok_or_else(|| TransportError::Connect(format!("no link to {}", addr)))
    }

    fn connection_state_exists(&self, addr: &str) -> bool {
        self.node
            .links
            .lock()
            .expect("links lock")
            .contains_key(addr)
    }

    fn wallet_address(&self, peer_id: &str) -> Result<String, TransportError> {
        if peer_id.is_empty() {
            return Err(TransportError::InvalidPeerId(peer_id.to_string()));
        }
        Ok(peer_id.to_string())
    }

    fn peer_events(&self) -> broadcast::Receiver<PeerStateEvent> {
        self.node.peer_events.subscribe()
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent<SimClient>> {
        self.node.conn_events.subscribe()
    }

    async fn next_inbound(&self) -> Option<Envelope> {
        self.inbound_rx.lock().await.recv().await
    }
}
