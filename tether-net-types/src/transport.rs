//! Transport abstraction for tether networking.
//!
//! Decouples the messaging layer from overlay-specific types.
//! Production uses the real P2P overlay binding (impl `OverlayTransport`);
//! test harnesses provide in-memory implementations.

use crate::{AckEvent, ConnectionEvent, Envelope, Payload, PeerStateEvent};
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Error type for overlay transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Listen failed: {0}")]
    Listen(String),
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Signing failed: {0}")]
    Signing(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Connection closed")]
    Closed,
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),
}

/// Options handed to the overlay when it starts listening.
#[derive(Clone, Debug)]
pub struct ListenOptions {
    /// Interval between overlay keepalive probes.
    pub keepalive_interval: Duration,
    /// Keepalive silence after which the overlay marks a peer unreachable.
    pub keepalive_timeout: Duration,
    /// Optional proxy to register through; when set, listen() must not
    /// return until proxy registration completes.
    pub proxy: Option<String>,
    /// Network id tag isolating this overlay from others.
    pub network_id: u32,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(15),
            keepalive_timeout: Duration::from_secs(45),
            proxy: None,
            network_id: 1,
        }
    }
}

/// A live connection to one remote peer.
///
/// Message ids are caller-assigned; the overlay reports delivery through
/// the [`ack_events`](OverlayClient::ack_events) stream rather than the
/// send call itself. Streams are sub-channels for sustained transfers
/// with a byte counter the session layer samples for throughput.
pub trait OverlayClient: Send + Sync + 'static {
    /// Overlay address of the remote peer.
    fn remote_address(&self) -> String;

    /// Overlay-assigned id of the remote peer.
    fn remote_peer_id(&self) -> String;

    /// Sign and write a message; delivery outcome arrives as an
    /// [`AckEvent`] for `msg_id`. `reply_to` correlates replies to an
    /// earlier inbound message.
    fn send_with_ack(
        &self,
        msg_id: &str,
        reply_to: Option<&str>,
        payload: Payload,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Synchronous request/reply with a bounded wait.
    fn request(
        &self,
        payload: Payload,
        timeout: Duration,
    ) -> impl Future<Output = Result<Bytes, TransportError>> + Send;

    /// Open a sub-stream; returns the transport-assigned stream id.
    fn open_stream(&self) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Close a sub-stream, cancelling any write still in flight on it.
    fn close_stream(
        &self,
        stream_id: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// As [`send_with_ack`](OverlayClient::send_with_ack) but through a
    /// stream; returns bytes written.
    fn stream_send_with_ack(
        &self,
        stream_id: &str,
        session_id: &str,
        msg_id: &str,
        payload: Payload,
    ) -> impl Future<Output = Result<usize, TransportError>> + Send;

    /// Total bytes written on a stream since it was opened.
    fn stream_data_count(&self, stream_id: &str) -> u64;

    /// True while the overlay itself is still retrying `msg_id`
    /// internally; callers should not stack their own retry on top.
    fn in_retry_window(&self, msg_id: &str) -> bool;

    /// ACK status events for messages sent through this client.
    fn ack_events(&self) -> broadcast::Receiver<AckEvent>;

    /// Cancelled when the underlying connection closes.
    fn closed(&self) -> CancellationToken;

    /// Close the connection.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Overlay transport abstraction.
///
/// Provides listening, peer bootstrap, client handles, and the event
/// streams the messaging layer is driven by. This is the primary seam
/// for swapping the production overlay with in-memory channels.
pub trait OverlayTransport: Send + Sync + fmt::Debug + 'static {
    /// The client type produced by this transport.
    type Client: OverlayClient;

    /// This node's own overlay address.
    fn local_address(&self) -> String;

    /// Start listening; returns once the overlay is accepting traffic
    /// (and proxy registration has completed, when configured).
    fn listen(
        &self,
        addr: &str,
        opts: ListenOptions,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Ask the overlay to work toward a connection with `addr`.
    /// Non-blocking; progress is reported via peer-state events.
    fn bootstrap(&self, addr: &str) -> impl Future<Output = ()> + Send;

    /// Obtain a client handle for an established connection.
    fn dial(
        &self,
        addr: &str,
    ) -> impl Future<Output = Result<Arc<Self::Client>, TransportError>> + Send;

    /// Whether the overlay currently holds a connection state for `addr`.
    fn connection_state_exists(&self, addr: &str) -> bool;

    /// Derive the stable application-level address for an overlay peer
    /// id. Transports where the two coincide return the id unchanged.
    fn wallet_address(&self, peer_id: &str) -> Result<String, TransportError>;

    /// Reachability change events.
    fn peer_events(&self) -> broadcast::Receiver<PeerStateEvent>;

    /// Connection lifecycle events carrying client handles.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent<Self::Client>>;

    /// Next inbound envelope, or None once the transport shuts down.
    fn next_inbound(&self) -> impl Future<Output = Option<Envelope>> + Send;
}
