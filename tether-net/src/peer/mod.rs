//! Peer - the unit of delivery reliability.
//!
//! A Peer owns one remote peer's outbound queue, retry policy, ACK
//! bookkeeping and open sessions. Once a send is accepted it reaches
//! exactly one terminal outcome per message id (delivered-and-acked,
//! delivered-and-replied, or failed) despite connection churn
//! underneath.
//!
//! Locking discipline: all queue/session/state mutations happen under
//! the peer's own mutex, and the mutex is never held across a network
//! call. Sends and stream operations always run on a client handle
//! cloned out of the critical section.

mod dedup;
mod failed;
mod queue;

pub use failed::{FailedCount, FailedCountSnapshot};

use crate::config::NetworkConfig;
use crate::error::NetError;
use crate::session::Session;
use bytes::Bytes;
use dedup::RecentCache;
use queue::{MsgWrap, SendQueue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tether_net_types::{AckEvent, AckStatus, OverlayClient, Payload};
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Connection state of a peer, owned exclusively by the Peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Lifecycle of the per-peer retry worker. A single `ensure_running`
/// entry point prevents double-start races; `Draining` marks the window
/// where the worker saw an empty queue but has not yet committed to
/// exiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Running,
    Draining,
}

/// Options for one send call.
#[derive(Clone, Copy, Debug, Default)]
pub struct SendOptions {
    /// Caller-side bound on the blocking wait, independent of the retry
    /// budget. On expiry the queue entry is failed and removed.
    pub deadline: Option<Duration>,
}

/// Diagnostic snapshot of one peer.
#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    pub address: String,
    pub peer_id: Option<String>,
    pub state: ConnectState,
    pub queue_len: usize,
    pub bad_quality: bool,
    pub closed_at: Option<Instant>,
    pub failed: FailedCountSnapshot,
}

struct PeerInner<C: OverlayClient> {
    peer_id: Option<String>,
    client: Option<Arc<C>>,
    state: ConnectState,
    queue: SendQueue,
    sessions: HashMap<String, Arc<Session<C>>>,
    received: RecentCache,
    bad_quality: bool,
    worker: WorkerState,
    waiting_reconnect: bool,
    closed_at: Option<Instant>,
    /// Connection epoch; bumped on every `set_client` so a stale ACK
    /// loop cannot tear down a newer connection.
    epoch: u64,
}

/// One remote peer. Created lazily on first reference, keyed by its
/// stable application address; lives for the process lifetime while
/// connections churn underneath.
pub struct Peer<C: OverlayClient> {
    address: String,
    config: NetworkConfig,
    failed: FailedCount,
    inner: Mutex<PeerInner<C>>,
}

impl<C: OverlayClient> Peer<C> {
    pub fn new(address: impl Into<String>, config: NetworkConfig) -> Arc<Self> {
        let received = RecentCache::new(config.dedup_cache_size);
        Arc::new(Self {
            address: address.into(),
            config,
            failed: FailedCount::default(),
            inner: Mutex::new(PeerInner {
                peer_id: None,
                client: None,
                state: ConnectState::Disconnected,
                queue: SendQueue::default(),
                sessions: HashMap::new(),
                received,
                bad_quality: false,
                worker: WorkerState::Idle,
                waiting_reconnect: false,
                closed_at: None,
                epoch: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PeerInner<C>> {
        self.inner.lock().expect("peer lock")
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn peer_id(&self) -> Option<String> {
        self.lock().peer_id.clone()
    }

    pub fn connect_state(&self) -> ConnectState {
        self.lock().state
    }

    pub fn client(&self) -> Option<Arc<C>> {
        self.lock().client.clone()
    }

    pub fn is_bad_quality(&self) -> bool {
        self.lock().bad_quality
    }

    pub fn failed(&self) -> &FailedCount {
        &self.failed
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let inner = self.lock();
        PeerSnapshot {
            address: self.address.clone(),
            peer_id: inner.peer_id.clone(),
            state: inner.state,
            queue_len: inner.queue.len(),
            bad_quality: inner.bad_quality,
            closed_at: inner.closed_at,
            failed: self.failed.snapshot(),
        }
    }

    // ==================== Connection lifecycle ====================

    /// Attach a fresh client connection.
    ///
    /// A duplicate connect event (client already attached) is a no-op.
    /// Otherwise the received-message cache is purged (a new connection
    /// is a new ACK namespace), the sticky bad-quality flag clears, the
    /// ACK loop for this connection epoch starts, and the retry worker
    /// resumes when messages are waiting.
    pub fn set_client(self: &Arc<Self>, client: Arc<C>) {
        let (epoch, start_worker) = {
            let mut inner = self.lock();
            if inner.client.is_some() && inner.state == ConnectState::Connected {
                tracing::debug!(peer = %self.address, "Duplicate connect event ignored");
                return;
            }
            inner.received.clear();
            inner.peer_id = Some(client.remote_peer_id());
            inner.client = Some(client.clone());
            inner.state = ConnectState::Connected;
            inner.bad_quality = false;
            inner.closed_at = None;
            inner.epoch += 1;
            (inner.epoch, !inner.queue.is_empty())
        };
        tracing::debug!(peer = %self.address, epoch, "Client attached");
        self.spawn_ack_loop(epoch, client.ack_events(), client.closed());
        if start_worker {
            self.ensure_retry_worker();
        }
    }

    /// Adapter path for an overlay disconnect event. Idempotent with the
    /// close-signal teardown the ACK loop performs.
    pub async fn notify_disconnected(self: &Arc<Self>) {
        let epoch = self.lock().epoch;
        self.handle_connection_closed(epoch).await;
    }

    /// Record that a connection attempt is in flight. Only meaningful
    /// from a non-connected state.
    pub fn mark_connecting(&self) {
        let mut inner = self.lock();
        if !matches!(inner.state, ConnectState::Connected) {
            inner.state = ConnectState::Connecting;
        }
    }

    /// Mark this peer explicitly closed (driven by `Network::close`).
    pub fn mark_closed(&self) {
        self.lock().state = ConnectState::Closed;
    }

    /// Fail everything and drop the connection; used on service
    /// shutdown.
    pub async fn teardown(&self) {
        let (client, sessions, entries) = {
            let mut inner = self.lock();
            inner.state = ConnectState::Closed;
            let sessions: Vec<_> = inner.sessions.values().cloned().collect();
            (inner.client.take(), sessions, inner.queue.drain_all())
        };
        for entry in entries {
            entry.complete(Err(NetError::PeerTornDown(self.address.clone())));
        }
        for session in sessions {
            let _ = session.close().await;
        }
        if let Some(client) = client {
            let _ = client.close().await;
        }
    }

    // ==================== Send paths ====================

    /// Queue a fire-and-forget message and wait for its transport ACK.
    /// The id is generated when absent; an id already queued on this
    /// peer is rejected, never overwritten.
    pub async fn send(
        self: &Arc<Self>,
        id: Option<String>,
        payload: Payload,
        opts: SendOptions,
    ) -> Result<(), NetError> {
        self.enqueue_and_wait(id, None, payload, false, None, opts)
            .await
            .map(|_| ())
    }

    /// Queue a request and wait for the application-level reply; a
    /// transport ACK alone does not complete it.
    pub async fn send_and_wait_reply(
        self: &Arc<Self>,
        id: Option<String>,
        payload: Payload,
        opts: SendOptions,
    ) -> Result<Bytes, NetError> {
        match self
            .enqueue_and_wait(id, None, payload, true, None, opts)
            .await?
        {
            Some(body) => Ok(body),
            None => Err(NetError::PeerTornDown(self.address.clone())),
        }
    }

    /// As [`send`](Peer::send) but through a session stream. When
    /// `write_timeout` is set, a stalled write past the deadline gets its
    /// session force-closed and the message retried on a fresh stream.
    pub async fn stream_send(
        self: &Arc<Self>,
        session_id: &str,
        id: Option<String>,
        payload: Payload,
        write_timeout: Option<Duration>,
        opts: SendOptions,
    ) -> Result<(), NetError> {
        self.enqueue_and_wait(
            id,
            Some(session_id.to_string()),
            payload,
            false,
            write_timeout,
            opts,
        )
        .await
        .map(|_| ())
    }

    /// Stream variant of [`send_and_wait_reply`](Peer::send_and_wait_reply).
    pub async fn stream_send_and_wait_reply(
        self: &Arc<Self>,
        session_id: &str,
        id: Option<String>,
        payload: Payload,
        write_timeout: Option<Duration>,
        opts: SendOptions,
    ) -> Result<Bytes, NetError> {
        match self
            .enqueue_and_wait(
                id,
                Some(session_id.to_string()),
                payload,
                true,
                write_timeout,
                opts,
            )
            .await?
        {
            Some(body) => Ok(body),
            None => Err(NetError::PeerTornDown(self.address.clone())),
        }
    }

    async fn enqueue_and_wait(
        self: &Arc<Self>,
        id: Option<String>,
        session_id: Option<String>,
        payload: Payload,
        need_reply: bool,
        write_timeout: Option<Duration>,
        opts: SendOptions,
    ) -> Result<Option<Bytes>, NetError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let (reply_tx, reply_rx) = oneshot::channel();
        let wrap = MsgWrap::new(
            id.clone(),
            session_id,
            payload,
            need_reply,
            write_timeout,
            reply_tx,
        );
        let client = {
            let mut inner = self.lock();
            inner.queue.push(wrap)?;
            inner.client.clone()
        };
        tracing::debug!(peer = %self.address, msg = %id, "Message queued");
        self.ensure_retry_worker();

        match client {
            // Immediate best-effort attempt; the retry worker covers
            // everything after this.
            Some(client) => {
                let peer = self.clone();
                let msg_id = id.clone();
                tokio::spawn(async move {
                    peer.deliver_once(client, &msg_id).await;
                });
            }
            // No connection: arm the reconnect wait that bounds this
            // message's lifetime.
            None => self.lost_conn(),
        }

        let outcome = match opts.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, reply_rx).await {
                Ok(res) => res,
                Err(_) => {
                    if let Some(entry) = self.lock().queue.remove(&id) {
                        entry.complete(Err(NetError::DeadlineExceeded(id.clone())));
                    }
                    return Err(NetError::DeadlineExceeded(id));
                }
            },
            None => reply_rx.await,
        };
        match outcome {
            Ok(result) => result,
            Err(_) => Err(NetError::PeerTornDown(self.address.clone())),
        }
    }

    /// One delivery attempt for the queued entry `id`, direct or
    /// through its session stream. ACK outcomes arrive asynchronously.
    async fn deliver_once(self: &Arc<Self>, client: Arc<C>, id: &str) {
        let params = {
            let mut inner = self.lock();
            inner.queue.get_mut(id).map(|entry| {
                entry.last_retry_at = Some(Instant::now());
                (
                    entry.payload.clone(),
                    entry.session_id.clone(),
                    entry.write_timeout,
                )
            })
        };
        let Some((payload, session_id, write_timeout)) = params else {
            return; // completed while we were scheduled
        };

        match session_id {
            Some(session_id) => {
                let session = self.ensure_session(&session_id);
                if let Err(e) = session.open(client.clone()).await {
                    self.failed.record_send();
                    tracing::debug!(peer = %self.address, session = %session_id, error = %e, "Stream open failed");
                    return;
                }
                let Some(stream_id) = session.stream_id() else {
                    return;
                };
                if let Some(wt) = write_timeout {
                    if let Some(entry) = self.lock().queue.get_mut(id) {
                        entry.deadline = Some(Instant::now() + wt);
                    }
                }
                match client
                    .stream_send_with_ack(&stream_id, &session_id, id, payload)
                    .await
                {
                    Ok(_written) => {
                        if let Some(entry) = self.lock().queue.get_mut(id) {
                            entry.deadline = None;
                        }
                    }
                    Err(e) => {
                        self.failed.record_send();
                        tracing::debug!(peer = %self.address, msg = %id, error = %e, "Stream send failed");
                    }
                }
            }
            None => {
                if let Err(e) = client.send_with_ack(id, None, payload).await {
                    self.failed.record_send();
                    tracing::debug!(peer = %self.address, msg = %id, error = %e, "Send attempt failed");
                }
            }
        }
    }

    // ==================== Inbound ====================

    /// Route an application reply to its pending request. Returns true
    /// when a waiting entry was completed.
    pub fn receive(&self, orig_id: &str, body: Bytes) -> bool {
        let entry = self.lock().queue.remove_if(orig_id, |e| e.need_reply);
        match entry {
            Some(entry) => {
                entry.complete(Ok(Some(body)));
                true
            }
            None => false,
        }
    }

    /// Record an inbound message id. Returns false for a duplicate
    /// within the dedup horizon, in which case the message must be
    /// dropped, not re-dispatched.
    pub fn mark_received(&self, msg_id: &str) -> bool {
        self.lock().received.insert(msg_id)
    }

    /// Inbound stream accounting for a session's throughput window.
    /// Creates the session state on first use (receiver side never
    /// opens the stream itself).
    pub fn record_rx(&self, session_id: &str, bytes: u64) {
        self.ensure_session(session_id).record_rx(bytes);
    }

    // ==================== Sessions ====================

    pub fn session(&self, session_id: &str) -> Option<Arc<Session<C>>> {
        self.lock().sessions.get(session_id).cloned()
    }

    /// Get or lazily create the session for `session_id`.
    pub fn ensure_session(&self, session_id: &str) -> Arc<Session<C>> {
        let mut inner = self.lock();
        inner
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(Session::new(
                    session_id,
                    self.config.sample_ring_size,
                    self.config.sample_interval,
                ))
            })
            .clone()
    }

    // ==================== Retry worker ====================

    /// Single entry point for starting the retry worker; safe to call
    /// from any send path without double-start races.
    fn ensure_retry_worker(self: &Arc<Self>) {
        {
            let mut inner = self.lock();
            match inner.worker {
                WorkerState::Running => return,
                WorkerState::Draining => {
                    // Worker is mid-drain; flip it back so it continues.
                    inner.worker = WorkerState::Running;
                    return;
                }
                WorkerState::Idle => inner.worker = WorkerState::Running,
            }
        }
        let peer = self.clone();
        tokio::spawn(async move {
            peer.retry_loop().await;
        });
    }

    async fn retry_loop(self: Arc<Self>) {
        tracing::debug!(peer = %self.address, "Retry worker started");
        let mut tick = tokio::time::interval(self.config.retry_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await; // the first tick is immediate; skip it

        loop {
            tick.tick().await;

            let mut to_fail: Vec<MsgWrap> = Vec::new();
            let mut to_close: Vec<Arc<Session<C>>> = Vec::new();
            let mut to_send: Vec<String> = Vec::new();
            let client = {
                let mut inner = self.lock();
                if inner.queue.is_empty() {
                    inner.worker = WorkerState::Draining;
                    drop(inner);
                    let mut inner = self.lock();
                    if inner.worker == WorkerState::Draining && inner.queue.is_empty() {
                        inner.worker = WorkerState::Idle;
                        tracing::debug!(peer = %self.address, "Retry worker drained");
                        return;
                    }
                    inner.worker = WorkerState::Running;
                    continue;
                }

                let now = Instant::now();
                let max_retries = self.config.max_retries;

                // Entries over budget fail terminally and mark the peer.
                let over: Vec<String> = inner
                    .queue
                    .iter()
                    .filter(|e| e.retry_count >= max_retries)
                    .map(|e| e.id.clone())
                    .collect();
                for id in over {
                    if let Some(entry) = inner.queue.remove(&id) {
                        inner.bad_quality = true;
                        to_fail.push(entry);
                    }
                }

                let client = inner.client.clone();
                let mut advanced = 0usize;
                let mut stalled: Vec<String> = Vec::new();
                for entry in inner.queue.iter_mut() {
                    if advanced >= self.config.retry_burst {
                        break;
                    }
                    let last_attempt = entry.last_retry_at.unwrap_or(entry.created_at);
                    if now.duration_since(last_attempt) < self.config.retry_grace {
                        continue;
                    }
                    if let Some(deadline) = entry.deadline {
                        if now >= deadline {
                            // Stalled stream write: close the session to
                            // cancel it; the entry retries next tick on a
                            // reopened stream.
                            if let Some(session_id) = &entry.session_id {
                                stalled.push(session_id.clone());
                            }
                            entry.deadline = None;
                            continue;
                        }
                    }
                    let Some(client) = &client else { continue };
                    if client.in_retry_window(&entry.id) {
                        continue;
                    }
                    entry.retry_count += 1;
                    to_send.push(entry.id.clone());
                    advanced += 1;
                }
                for session_id in stalled {
                    if let Some(session) = inner.sessions.get(&session_id) {
                        to_close.push(session.clone());
                    }
                }
                client
            };

            for entry in to_fail {
                tracing::warn!(peer = %self.address, msg = %entry.id, "Retry budget exhausted, failing message");
                entry.complete(Err(NetError::BadQuality(self.address.clone())));
            }
            for session in to_close {
                tracing::debug!(peer = %self.address, session = %session.id(), "Write deadline passed, closing session to cancel stalled write");
                let _ = session.close().await;
            }
            if let Some(client) = client {
                // Attempts are spawned so a stalled stream write can
                // never wedge the tick loop that would cancel it.
                for id in to_send {
                    let peer = self.clone();
                    let client = client.clone();
                    tokio::spawn(async move {
                        peer.deliver_once(client, &id).await;
                    });
                }
            }
        }
    }

    // ==================== ACK loop & connection loss ====================

    /// One ACK-notification loop per connection epoch. Exits when the
    /// connection's close signal fires (tearing the connection state
    /// down) or the event stream ends.
    fn spawn_ack_loop(
        self: &Arc<Self>,
        epoch: u64,
        mut acks: broadcast::Receiver<AckEvent>,
        closed: CancellationToken,
    ) {
        let peer = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => {
                        peer.handle_connection_closed(epoch).await;
                        break;
                    }
                    event = acks.recv() => match event {
                        Ok(event) => peer.handle_ack(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(peer = %peer.address, skipped, "ACK stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            peer.handle_connection_closed(epoch).await;
                            break;
                        }
                    }
                }
            }
        });
    }

    fn handle_ack(&self, event: AckEvent) {
        match event.status {
            AckStatus::Success => {
                // Fire-and-forget completes on ACK; a reply-needed entry
                // stays queued until the application reply arrives.
                let entry = self.lock().queue.remove_if(&event.msg_id, |e| !e.need_reply);
                if let Some(entry) = entry {
                    tracing::debug!(peer = %self.address, msg = %event.msg_id, "Delivery acknowledged");
                    entry.complete(Ok(None));
                }
            }
            AckStatus::Failure => {
                self.failed.record_send();
                let failed = {
                    let mut inner = self.lock();
                    match inner.queue.get_mut(&event.msg_id) {
                        Some(entry) => {
                            entry.retry_count += 1;
                            if entry.retry_count > self.config.max_retries {
                                inner.bad_quality = true;
                                inner.queue.remove(&event.msg_id)
                            } else {
                                None
                            }
                        }
                        None => None,
                    }
                };
                if let Some(entry) = failed {
                    tracing::warn!(peer = %self.address, msg = %event.msg_id, "ACK failures exhausted retry budget");
                    entry.complete(Err(NetError::BadQuality(self.address.clone())));
                }
            }
        }
    }

    /// Teardown for a closed connection: clear the client, close every
    /// session, stamp the close time, and arm the reconnect wait.
    /// Guarded by epoch so a stale loop cannot tear down a newer
    /// connection; idempotent for the same epoch.
    async fn handle_connection_closed(self: &Arc<Self>, epoch: u64) {
        let sessions = {
            let mut inner = self.lock();
            if inner.epoch != epoch || inner.client.is_none() {
                return;
            }
            inner.client = None;
            if inner.state == ConnectState::Connected {
                inner.state = ConnectState::Disconnected;
            }
            inner.closed_at = Some(Instant::now());
            inner.sessions.values().cloned().collect::<Vec<_>>()
        };
        tracing::debug!(peer = %self.address, epoch, "Connection closed");
        self.failed.record_disconnect();
        for session in sessions {
            let _ = session.close().await;
        }
        self.lost_conn();
    }

    #[cfg(test)]
    fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Bound the lifetime of queued messages across a disconnection:
    /// wait for a fresh connection up to the reconnect timeout, then
    /// fail the whole queue with a bad-quality error.
    fn lost_conn(self: &Arc<Self>) {
        {
            let mut inner = self.lock();
            if inner.queue.is_empty() || inner.waiting_reconnect {
                return;
            }
            inner.waiting_reconnect = true;
        }
        let peer = self.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + peer.config.reconnect_timeout;
            let reconnected = loop {
                if peer.client().is_some() {
                    break true;
                }
                if Instant::now() >= deadline {
                    break false;
                }
                tokio::time::sleep(peer.config.reconnect_poll).await;
            };
            let entries = {
                let mut inner = peer.lock();
                inner.waiting_reconnect = false;
                if reconnected || inner.client.is_some() {
                    Vec::new()
                } else {
                    inner.bad_quality = true;
                    inner.state = ConnectState::Failed;
                    inner.queue.drain_all()
                }
            };
            if !entries.is_empty() {
                tracing::warn!(
                    peer = %peer.address,
                    count = entries.len(),
                    "Reconnect wait expired, failing queued messages"
                );
                for entry in entries {
                    entry.complete(Err(NetError::BadQuality(peer.address.clone())));
                }
            }
        });
    }
}
