//! Overlay event types.
//!
//! The transport surfaces three event families: peer reachability
//! (driven by its keepalive machinery), connection lifecycle (a client
//! handle became usable or went away), and per-message ACK status.

use std::sync::Arc;

/// Reachability as reported by the overlay's peer-state machinery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Reachable,
    Unreachable,
    Unknown,
}

/// A reachability change for one overlay address.
#[derive(Clone, Debug)]
pub struct PeerStateEvent {
    pub address: String,
    pub state: PeerState,
}

/// Transport-level acknowledgment outcome for one outbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckStatus {
    Success,
    Failure,
}

/// ACK status for the message identified by `msg_id`.
#[derive(Clone, Debug)]
pub struct AckEvent {
    pub msg_id: String,
    pub status: AckStatus,
}

/// Connection lifecycle: a usable client handle appeared for a peer, or
/// an existing connection went away.
#[derive(Debug)]
pub enum ConnectionEvent<C> {
    Connected {
        address: String,
        peer_id: String,
        client: Arc<C>,
    },
    Disconnected {
        address: String,
        peer_id: String,
    },
}

// Manual impl: `Arc<C>` is Clone regardless of whether C is.
impl<C> Clone for ConnectionEvent<C> {
    fn clone(&self) -> Self {
        match self {
            ConnectionEvent::Connected {
                address,
                peer_id,
                client,
            } => ConnectionEvent::Connected {
                address: address.clone(),
                peer_id: peer_id.clone(),
                client: client.clone(),
            },
            ConnectionEvent::Disconnected { address, peer_id } => ConnectionEvent::Disconnected {
                address: address.clone(),
                peer_id: peer_id.clone(),
            },
        }
    }
}
