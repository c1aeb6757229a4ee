//! Per-peer failure counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts dial/send/recv/disconnect failures for one peer. Consumed by
/// upstream peer-selection logic; never reset while the peer lives.
#[derive(Debug, Default)]
pub struct FailedCount {
    dial: AtomicU64,
    send: AtomicU64,
    recv: AtomicU64,
    disconnect: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FailedCountSnapshot {
    pub dial: u64,
    pub send: u64,
    pub recv: u64,
    pub disconnect: u64,
}

impl FailedCount {
    pub fn record_dial(&self) {
        self.dial.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send(&self) {
        self.send.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recv(&self) {
        self.recv.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.disconnect.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FailedCountSnapshot {
        FailedCountSnapshot {
            dial: self.dial.load(Ordering::Relaxed),
            send: self.send.load(Ordering::Relaxed),
            recv: self.recv.load(Ordering::Relaxed),
            disconnect: self.disconnect.load(Ordering::Relaxed),
        }
    }
}
