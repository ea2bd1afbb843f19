//! [`Outbox`] – ordered, non-blocking handoff from edge callbacks to a
//! [`PublishSink`].
//!
//! Producers enqueue on an unbounded channel and return immediately. One
//! worker task drains the queue and publishes in submission order. A failed
//! publish is logged, counted and dropped; it never stops the worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pulsebridge_types::{BridgeError, Payload, RateSample, SampleSink, VirtualPin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::sink::PublishSink;

/// How long [`Outbox::close`] waits for queued payloads by default.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivery totals returned by [`Outbox::close`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxReport {
    pub published: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Tally {
    enqueued: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
}

impl Tally {
    /// Totals so far; anything enqueued but not yet settled counts as failed.
    fn settle(&self) -> OutboxReport {
        let enqueued = self.enqueued.load(Ordering::Acquire);
        let published = self.published.load(Ordering::Acquire);
        OutboxReport {
            published,
            failed: enqueued.saturating_sub(published),
        }
    }
}

pub struct Outbox {
    pin: VirtualPin,
    drain_timeout: Duration,
    tally: Arc<Tally>,
    tx: Mutex<Option<mpsc::UnboundedSender<Payload>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Outbox {
    /// Start the worker task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn PublishSink>, pin: VirtualPin) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let tally = Arc::new(Tally::default());
        let worker = tokio::spawn(drain(rx, sink, pin, Arc::clone(&tally)));
        Self {
            pin,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            tally,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Bound how long [`close`](Self::close) waits for the queue to drain.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Enqueue `payload` without waiting for delivery.
    pub fn push(&self, payload: Payload) -> Result<(), BridgeError> {
        let guard = self.tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| BridgeError::Channel("outbox is closed".to_string()))?;
        tx.send(payload)
            .map_err(|_| BridgeError::Channel("outbox worker has stopped".to_string()))?;
        self.tally.enqueued.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Stop accepting payloads and publish everything already queued, for at
    /// most the drain timeout. Payloads still queued or in flight when it
    /// expires are abandoned and reported as failed. A second call returns an
    /// empty report.
    pub async fn close(&self) -> OutboxReport {
        drop(self.tx.lock().take());
        let worker = self.worker.lock().take();
        let Some(mut worker) = worker else {
            return OutboxReport::default();
        };
        match tokio::time::timeout(self.drain_timeout, &mut worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(pin = %self.pin, error = %e, "outbox worker ended abnormally");
            }
            Err(_) => {
                worker.abort();
                let report = self.tally.settle();
                warn!(
                    pin = %self.pin,
                    timeout = ?self.drain_timeout,
                    abandoned = report
                        .failed
                        .saturating_sub(self.tally.failed.load(Ordering::Acquire)),
                    "outbox did not drain in time, abandoning queued payloads"
                );
            }
        }
        self.tally.settle()
    }
}

impl SampleSink for Outbox {
    fn submit(&self, sample: RateSample) -> Result<(), BridgeError> {
        self.push(Payload::Rate(sample.value))
    }
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<Payload>,
    sink: Arc<dyn PublishSink>,
    pin: VirtualPin,
    tally: Arc<Tally>,
) {
    while let Some(payload) = rx.recv().await {
        match sink.publish(pin, payload).await {
            Ok(()) => {
                tally.published.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => {
                tally.failed.fetch_add(1, Ordering::AcqRel);
                warn!(%pin, error = %e, "publish failed, payload dropped");
            }
        }
    }
    debug!(
        %pin,
        published = tally.published.load(Ordering::Acquire),
        failed = tally.failed.load(Ordering::Acquire),
        "outbox drained"
    );
}
