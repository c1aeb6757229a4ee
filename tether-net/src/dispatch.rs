//! Inbound message dispatch.
//!
//! Business subsystems register one handler per [`MessageKind`]; the
//! inbound pump routes each deduplicated envelope through this table.
//! A kind with no registered handler is logged and dropped; inbound
//! traffic is never an error for the messaging layer itself.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tether_net_types::{Envelope, MessageKind};

/// An inbound message handler. Returns a boxed future so handlers can
/// do real async work (store lookups, channel updates).
pub type Handler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Dispatch table keyed by message kind.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<MessageKind, Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`, replacing any previous one.
    pub fn register(&self, kind: MessageKind, handler: Handler) {
        self.handlers
            .write()
            .expect("dispatcher lock")
            .insert(kind, handler);
    }

    /// Convenience wrapper for async closures.
    pub fn register_fn<F, Fut>(&self, kind: MessageKind, f: F)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(kind, Arc::new(move |env| f(env).boxed()));
    }

    pub fn is_registered(&self, kind: MessageKind) -> bool {
        self.handlers
            .read()
            .expect("dispatcher lock")
            .contains_key(&kind)
    }

    /// Run the handler for the envelope's kind. Handler panics are
    /// contained and logged so one bad message cannot kill the inbound
    /// pump.
    pub async fn dispatch(&self, envelope: Envelope) {
        let handler = self
            .handlers
            .read()
            .expect("dispatcher lock")
            .get(&envelope.payload.kind)
            .cloned();
        let Some(handler) = handler else {
            tracing::warn!(
                kind = %envelope.payload.kind,
                msg = %envelope.msg_id,
                "No handler for inbound message kind, dropping"
            );
            return;
        };
        let kind = envelope.payload.kind;
        let msg_id = envelope.msg_id.clone();
        if AssertUnwindSafe(handler(envelope))
            .catch_unwind()
            .await
            .is_err()
        {
            tracing::error!(kind = %kind, msg = %msg_id, "Inbound handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_net_types::Payload;

    fn envelope(kind: MessageKind) -> Envelope {
        Envelope {
            from_address: "peer-a".into(),
            from_peer_id: "peer-a".into(),
            msg_id: "m1".into(),
            reply_to: None,
            session_id: None,
            payload: Payload::new(kind, Bytes::from_static(b"body")),
        }
    }

    #[tokio::test]
    async fn dispatches_to_the_registered_kind() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        dispatcher.register_fn(MessageKind::Channel, move |_env| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
            }
        });

        dispatcher.dispatch(envelope(MessageKind::Channel)).await;
        dispatcher.dispatch(envelope(MessageKind::Transfer)).await; // no handler: dropped
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_fn(MessageKind::Channel, |_env| async {
            panic!("handler bug");
        });
        // Must not propagate.
        dispatcher.dispatch(envelope(MessageKind::Channel)).await;
    }
}
