//! Tether Net Types
//!
//! Shared types for the networking layer, decoupled from both the
//! messaging implementation (tether-net) and any concrete overlay.
//!
//! This crate provides:
//! - `OverlayTransport` / `OverlayClient`: overlay transport abstraction
//! - `Envelope` / `Payload` / `MessageKind`: inbound message model
//! - Event types: peer reachability, connection lifecycle, ACK status

mod envelope;
mod events;
pub mod transport;

pub use envelope::{Envelope, MessageKind, Payload};
pub use events::{AckEvent, AckStatus, ConnectionEvent, PeerState, PeerStateEvent};
pub use transport::{ListenOptions, OverlayClient, OverlayTransport, TransportError};
