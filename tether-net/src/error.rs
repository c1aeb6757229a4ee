//! Error types for the tether-net crate.

use thiserror::Error;

/// Network layer errors for tether-net operations.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Transport error: {0}")]
    Transport(#[from] tether_net_types::TransportError),

    #[error("Peer {0} is not active")]
    PeerInactive(String),

    #[error("No client connection for {0}")]
    NoClient(String),

    #[error("Message {0} is already queued")]
    DuplicateMessage(String),

    #[error("Bad network quality for peer {0}")]
    BadQuality(String),

    #[error("Request to {0} timed out")]
    RequestTimeout(String),

    #[error("Timed out waiting for {0} to become reachable")]
    WaitTimeout(String),

    #[error("Send deadline exceeded for message {0}")]
    DeadlineExceeded(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Peer {0} was torn down before the message completed")]
    PeerTornDown(String),
}
