//! Inbound message model.
//!
//! The overlay carries opaque business payloads; the only structure this
//! layer sees is a kind tag (used for dispatch), correlation metadata
//! (message id, optional reply-to id) and an optional session tag for
//! stream-bound transfers.

use bytes::Bytes;

/// Tag identifying which business subsystem a payload belongs to.
///
/// Dispatch is an explicit table keyed by this variant; adding a new
/// message family is a compile-time-checked addition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Payment-channel protocol messages.
    Channel,
    /// Content-transfer protocol messages (file blocks, proofs).
    Transfer,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Channel => write!(f, "channel"),
            MessageKind::Transfer => write!(f, "transfer"),
        }
    }
}

/// An opaque business payload plus its dispatch tag.
#[derive(Clone, Debug)]
pub struct Payload {
    pub kind: MessageKind,
    pub body: Bytes,
}

impl Payload {
    pub fn new(kind: MessageKind, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    pub fn channel(body: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Channel, body)
    }

    pub fn transfer(body: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Transfer, body)
    }
}

/// An inbound message as delivered by the overlay.
///
/// `reply_to` is set when this message answers an earlier outbound
/// request; such envelopes are routed to the pending sender instead of
/// the dispatch table. `session_id` is set for stream-bound deliveries.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from_address: String,
    pub from_peer_id: String,
    pub msg_id: String,
    pub reply_to: Option<String>,
    pub session_id: Option<String>,
    pub payload: Payload,
}
