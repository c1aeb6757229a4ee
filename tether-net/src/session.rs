//! Sessions - stream-bound transfer state
//!
//! A Session is one opened sub-stream on a peer's connection, used for
//! sustained transfers. It samples the transport's byte counter on a
//! fixed interval and keeps a bounded ring of per-interval throughput
//! samples per direction. Volatile network-layer state: reset whenever
//! the owning connection churns.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_net_types::{OverlayClient, TransportError};
use tokio_util::sync::CancellationToken;

/// Bounded ring of per-interval byte counts; oldest evicted on overflow.
#[derive(Debug)]
pub(crate) struct SampleRing {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, sample: u64) {
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// Arithmetic mean of the retained samples; 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }
}

struct SessionInner<C> {
    client: Option<Arc<C>>,
    stream_id: Option<String>,
    sampler: Option<CancellationToken>,
    rx_sampler: Option<CancellationToken>,
    tx: SampleRing,
    rx: SampleRing,
    last_tx_count: u64,
    rx_accum: u64,
}

/// One logical sub-stream on a peer connection.
pub struct Session<C: OverlayClient> {
    id: String,
    sample_interval: Duration,
    inner: Mutex<SessionInner<C>>,
}

impl<C: OverlayClient> Session<C> {
    pub fn new(id: impl Into<String>, ring_capacity: usize, sample_interval: Duration) -> Self {
        Self {
            id: id.into(),
            sample_interval,
            inner: Mutex::new(SessionInner {
                client: None,
                stream_id: None,
                sampler: None,
                rx_sampler: None,
                tx: SampleRing::new(ring_capacity),
                rx: SampleRing::new(ring_capacity),
                last_tx_count: 0,
                rx_accum: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().expect("session lock").stream_id.is_some()
    }

    pub fn stream_id(&self) -> Option<String> {
        self.inner.lock().expect("session lock").stream_id.clone()
    }

    /// Open the underlying stream. Idempotent: an already-open session
    /// succeeds trivially.
    pub async fn open(self: &Arc<Self>, client: Arc<C>) -> Result<(), TransportError> {
        if self.is_open() {
            return Ok(());
        }
        let stream_id = client.open_stream().await?;

        let token = CancellationToken::new();
        let lost_stream_id = {
            let mut inner = self.inner.lock().expect("session lock");
            if inner.stream_id.is_some() {
                // Lost the race with a concurrent open; keep the winner.
                Some(stream_id)
            } else {
                inner.client = Some(client.clone());
                inner.stream_id = Some(stream_id);
                inner.sampler = Some(token.clone());
                inner.last_tx_count = 0;
                None
            }
        };
        if let Some(stream_id) = lost_stream_id {
            let _ = client.close_stream(&stream_id).await;
            return Ok(());
        }

        let session = self.clone();
        let interval = self.sample_interval;
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !session.sample_once() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Close the stream and stop sampling. Idempotent.
    pub async fn close(&self) -> Result<(), TransportError> {
        let (client, stream_id) = {
            let mut inner = self.inner.lock().expect("session lock");
            if let Some(token) = inner.sampler.take() {
                token.cancel();
            }
            if let Some(token) = inner.rx_sampler.take() {
                token.cancel();
            }
            (inner.client.take(), inner.stream_id.take())
        };
        if let (Some(client), Some(stream_id)) = (client, stream_id) {
            tracing::debug!(session = %self.id, stream = %stream_id, "Closing session stream");
            client.close_stream(&stream_id).await?;
        }
        Ok(())
    }

    /// Average outbound throughput in bytes/sec over the sample window.
    pub fn tx_avg_speed(&self) -> f64 {
        let inner = self.inner.lock().expect("session lock");
        inner.tx.mean() / self.sample_interval.as_secs_f64()
    }

    /// Average inbound throughput in bytes/sec over the sample window.
    pub fn rx_avg_speed(&self) -> f64 {
        let inner = self.inner.lock().expect("session lock");
        inner.rx.mean() / self.sample_interval.as_secs_f64()
    }

    /// Inbound stream accounting, fed by the dispatch path. Starts the
    /// rx sampler lazily: the receiving side never opens the stream, so
    /// the tx sampler is not available to drive the interval.
    pub fn record_rx(self: &Arc<Self>, bytes: u64) {
        let start_sampler = {
            let mut inner = self.inner.lock().expect("session lock");
            inner.rx_accum = inner.rx_accum.saturating_add(bytes);
            inner.rx_sampler.is_none()
        };
        if start_sampler {
            let token = CancellationToken::new();
            {
                let mut inner = self.inner.lock().expect("session lock");
                if inner.rx_sampler.is_some() {
                    return;
                }
                inner.rx_sampler = Some(token.clone());
            }
            let session = self.clone();
            let interval = self.sample_interval;
            tokio::spawn(async move {
                let start = tokio::time::Instant::now() + interval;
                let mut ticker = tokio::time::interval_at(start, interval);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let mut inner = session.inner.lock().expect("session lock");
                            let rx = std::mem::take(&mut inner.rx_accum);
                            inner.rx.push(rx);
                        }
                    }
                }
            });
        }
    }

    /// Take one tx sample. Returns false once the session has been
    /// closed and the loop should stop.
    fn sample_once(&self) -> bool {
        let mut inner = self.inner.lock().expect("session lock");
        let (Some(client), Some(stream_id)) = (inner.client.clone(), inner.stream_id.clone())
        else {
            return false;
        };
        let count = client.stream_data_count(&stream_id);
        let delta = count.saturating_sub(inner.last_tx_count);
        inner.last_tx_count = count;
        inner.tx.push(delta);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_on_overflow() {
        let mut ring = SampleRing::new(3);
        for s in [1, 2, 3, 4] {
            ring.push(s);
        }
        // 1 evicted; mean of [2, 3, 4]
        assert_eq!(ring.mean(), 3.0);
    }

    #[test]
    fn empty_ring_reports_zero() {
        let ring = SampleRing::new(4);
        assert_eq!(ring.mean(), 0.0);
    }

    // The averaging contract: samples [10, 20, 30] at a one-second
    // interval average to 20 bytes/sec.
    #[test]
    fn tx_average_is_arithmetic_mean() {
        let session: Session<crate::tests_support::NoopClient> =
            Session::new("s1", 16, Duration::from_secs(1));
        {
            let mut inner = session.inner.lock().unwrap();
            for s in [10, 20, 30] {
                inner.tx.push(s);
            }
        }
        assert_eq!(session.tx_avg_speed(), 20.0);
    }

    #[tokio::test]
    async fn rx_accumulator_feeds_the_ring_per_interval() {
        let session: Arc<Session<crate::tests_support::NoopClient>> =
            Arc::new(Session::new("s1", 16, Duration::from_secs(1)));
        session.record_rx(6);
        session.record_rx(4);
        {
            let mut inner = session.inner.lock().unwrap();
            let rx = std::mem::take(&mut inner.rx_accum);
            inner.rx.push(rx);
        }
        assert_eq!(session.rx_avg_speed(), 10.0);
    }
}
