//! Minimal in-crate client stub for unit tests.
//!
//! Integration tests use the full `tether-net-sim` transport; unit
//! tests that only need "a client" (type parameters, ACK injection)
//! use this no-op implementation.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tether_net_types::{AckEvent, OverlayClient, Payload, TransportError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub(crate) struct NoopClient {
    pub address: String,
    pub acks: broadcast::Sender<AckEvent>,
    pub closed: CancellationToken,
}

impl NoopClient {
    pub fn new(address: impl Into<String>) -> Arc<Self> {
        let (acks, _) = broadcast::channel(64);
        Arc::new(Self {
            address: address.into(),
            acks,
            closed: CancellationToken::new(),
        })
    }
}

impl OverlayClient for NoopClient {
    fn remote_address(&self) -> String {
        self.address.clone()
    }

    fn remote_peer_id(&self) -> String {
        self.address.clone()
    }

    async fn send_with_ack(
        &self,
        _msg_id: &str,
        _reply_to: Option<&str>,
        _payload: Payload,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn request(
        &self,
        _payload: Payload,
        _timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        Ok(Bytes::new())
    }

    async fn open_stream(&self) -> Result<String, TransportError> {
        Ok("stream-1".to_string())
    }

    async fn close_stream(&self, _stream_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn stream_send_with_ack(
        &self,
        _stream_id: &str,
        _session_id: &str,
        _msg_id: &str,
        payload: Payload,
    ) -> Result<usize, TransportError> {
        Ok(payload.body.len())
    }

    fn stream_data_count(&self, _stream_id: &str) -> u64 {
        0
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
        self.closed.cancel();
        Ok(())
    }
}
