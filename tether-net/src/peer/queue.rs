//! Outbound message queue for one peer.
//!
//! FIFO in submission order; the retry loop scans front-to-back each
//! tick. Every entry carries a one-shot reply channel that is always
//! completed before the entry is dropped: an entry leaves the queue
//! only through a terminal outcome.

use crate::error::NetError;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tether_net_types::Payload;
use tokio::sync::oneshot;

/// Terminal outcome delivered to the original caller: `Ok(None)` for an
/// acknowledged fire-and-forget send, `Ok(Some(body))` for a reply.
pub(crate) type SendOutcome = Result<Option<Bytes>, NetError>;

/// One queued outbound message.
pub(crate) struct MsgWrap {
    pub id: String,
    pub session_id: Option<String>,
    pub payload: Payload,
    pub need_reply: bool,
    pub reply_tx: oneshot::Sender<SendOutcome>,
    pub created_at: Instant,
    /// Stream write budget; None for non-stream sends.
    pub write_timeout: Option<Duration>,
    /// Armed when a stream write is in flight; on expiry the session is
    /// force-closed and the deadline cleared for the next attempt.
    pub deadline: Option<Instant>,
    pub retry_count: u32,
    pub last_retry_at: Option<Instant>,
}

impl MsgWrap {
    pub fn new(
        id: String,
        session_id: Option<String>,
        payload: Payload,
        need_reply: bool,
        write_timeout: Option<Duration>,
        reply_tx: oneshot::Sender<SendOutcome>,
    ) -> Self {
        Self {
            id,
            session_id,
            payload,
            need_reply,
            reply_tx,
            created_at: Instant::now(),
            write_timeout,
            deadline: None,
            retry_count: 0,
            last_retry_at: None,
        }
    }

    /// Complete the caller's wait. The receiver may already be gone
    /// (caller-side deadline); that is not an error.
    pub fn complete(self, outcome: SendOutcome) {
        let _ = self.reply_tx.send(outcome);
    }
}

/// FIFO queue with by-id lookup. At most one live entry per message id.
#[derive(Default)]
pub(crate) struct SendQueue {
    entries: VecDeque<MsgWrap>,
}

impl SendQueue {
    pub fn push(&mut self, msg: MsgWrap) -> Result<(), NetError> {
        if self.entries.iter().any(|e| e.id == msg.id) {
            return Err(NetError::DuplicateMessage(msg.id.clone()));
        }
        self.entries.push_back(msg);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, id: &str) -> Option<&MsgWrap> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut MsgWrap> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// Remove the entry with `id`, handing ownership (and its reply
    /// channel) to the caller.
    pub fn remove(&mut self, id: &str) -> Option<MsgWrap> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        self.entries.remove(idx)
    }

    /// Remove the entry only if `pred` holds for it.
    pub fn remove_if(&mut self, id: &str, pred: impl Fn(&MsgWrap) -> bool) -> Option<MsgWrap> {
        let idx = self.entries.iter().position(|e| e.id == id && pred(e))?;
        self.entries.remove(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MsgWrap> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MsgWrap> {
        self.entries.iter_mut()
    }

    /// Drain every entry, FIFO order.
    pub fn drain_all(&mut self) -> Vec<MsgWrap> {
        self.entries.drain(..).collect()
    }
}
