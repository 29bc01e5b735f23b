//! Testing utilities for code built on courier.
//!
//! Enabled with the `testing` feature.
//!
//! ## Recording deliveries
//!
//! [`Recorder`] is a [`Handler`] that keeps every delivery it sees. Register
//! it as a worker's default handler (or a type override) and await the
//! number of deliveries the test expects:
//!
//! ```ignore
//! use courier::testing::Recorder;
//!
//! let recorder = Recorder::new();
//! let dst = engine.register_worker("generic_dst", recorder.clone())?;
//! engine.post(&src, &dst, &event, None)?;
//!
//! let received = timeout(Duration::from_secs(5), recorder.wait_for(1)).await?;
//! assert_eq!(received[0].status, DeliveryStatus::Ok);
//! ```
//!
//! ## Counting down with `DeliveryLatch`
//!
//! When a test only cares that N deliveries happened, a latch avoids
//! holding every record:
//!
//! ```ignore
//! let latch = DeliveryLatch::new(100);
//! let dst = engine.register_worker("sink", latch.clone())?;
//! // ... post 100 events ...
//! latch.await_zero().await;
//! ```
//!
//! Tests should wait for meaning, not time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Notify;

use crate::dispatch::DeliveryStatus;
use crate::event::{Event, EventState};
use crate::sync::lock;
use crate::worker::{Handler, Worker};

// =============================================================================
// Recorder
// =============================================================================

/// One delivery as seen by a [`Recorder`].
#[derive(Debug, Clone)]
pub struct Received {
    pub source: Worker,
    pub destination: Worker,
    pub status: DeliveryStatus,
    pub event: Event,
    pub event_type: String,
    /// State observed inside the handler. Always `Delivering`.
    pub state: EventState,
    /// When the handler ran.
    pub at: Instant,
}

#[derive(Default)]
struct RecorderInner {
    received: Mutex<Vec<Received>>,
    notify: Notify,
}

/// Handler that records deliveries.
///
/// Clones share the same record.
#[derive(Clone, Default)]
pub struct Recorder {
    inner: Arc<RecorderInner>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every delivery so far, in delivery order.
    pub fn received(&self) -> Vec<Received> {
        lock(&self.inner.received, "recorder").clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.received, "recorder").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` deliveries have been recorded, then
    /// return them all.
    ///
    /// Wrap in `tokio::time::timeout` if the deliveries might never come.
    pub async fn wait_for(&self, count: usize) -> Vec<Received> {
        loop {
            // Register before checking so a delivery in between still wakes us.
            let notified = self.inner.notify.notified();
            {
                let received = lock(&self.inner.received, "recorder");
                if received.len() >= count {
                    return received.clone();
                }
            }
            notified.await;
        }
    }
}

impl Handler for Recorder {
    fn handle(&self, src: &Worker, dst: &Worker, status: DeliveryStatus, event: &Event) {
        lock(&self.inner.received, "recorder").push(Received {
            source: src.clone(),
            destination: dst.clone(),
            status,
            event: event.clone(),
            event_type: event.event_type().name().to_string(),
            state: event.state(),
            at: Instant::now(),
        });
        self.inner.notify.notify_waiters();
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("received", &self.len())
            .finish()
    }
}

// =============================================================================
// Delivery Latch
// =============================================================================

#[derive(Debug)]
struct LatchInner {
    remaining: AtomicUsize,
    notify: Notify,
}

/// Count-down latch that is also a [`Handler`].
///
/// Each delivery counts down by one. Clones share the same count.
///
/// # Panics
///
/// Counting down past zero panics; a test that receives more deliveries
/// than expected should fail loudly.
#[derive(Debug, Clone)]
pub struct DeliveryLatch {
    inner: Arc<LatchInner>,
}

impl DeliveryLatch {
    /// Create a latch expecting `expected` deliveries.
    pub fn new(expected: usize) -> Self {
        Self {
            inner: Arc::new(LatchInner {
                remaining: AtomicUsize::new(expected),
                notify: Notify::new(),
            }),
        }
    }

    pub fn count_down(&self) {
        let prev = self.inner.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("DeliveryLatch counted down below zero - more deliveries than expected");
        }
        if prev == 1 {
            self.inner.notify.notify_waiters();
        }
    }

    /// Wait for the count to reach zero. Returns immediately if it already
    /// has.
    pub async fn await_zero(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}

impl Handler for DeliveryLatch {
    fn handle(&self, _src: &Worker, _dst: &Worker, _status: DeliveryStatus, _event: &Event) {
        self.count_down();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::types::TypeRegistry;

    fn worker(name: &str) -> Worker {
        Worker::new(name, Arc::new(Recorder::new()))
    }

    #[tokio::test]
    async fn test_recorder_wait_for_wakes() {
        let recorder = Recorder::new();
        let ty = TypeRegistry::new().register_type("t", 0).unwrap();
        let event = Event::new(&ty);
        let w = worker("w");

        let waiter = {
            let recorder = recorder.clone();
            tokio::spawn(async move { recorder.wait_for(2).await })
        };
        recorder.handle(&w, &w, DeliveryStatus::Ok, &event);
        recorder.handle(&w, &w, DeliveryStatus::Flush, &event);

        let received = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_for should wake")
            .unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[1].status, DeliveryStatus::Flush);
        assert_eq!(received[0].event_type, "t");
    }

    #[test]
    fn test_latch_counts_down() {
        let latch = DeliveryLatch::new(2);
        assert_eq!(latch.remaining(), 2);
        latch.count_down();
        latch.clone().count_down();
        assert!(latch.is_complete());
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn test_latch_underflow_panics() {
        let latch = DeliveryLatch::new(1);
        latch.count_down();
        latch.count_down();
    }

    #[tokio::test]
    async fn test_latch_await_immediate() {
        let latch = DeliveryLatch::new(0);
        tokio::time::timeout(Duration::from_millis(100), latch.await_zero())
            .await
            .expect("should return immediately");
    }

    #[tokio::test]
    async fn test_latch_await_after_deliveries() {
        let latch = DeliveryLatch::new(2);
        let ty = TypeRegistry::new().register_type("t", 0).unwrap();
        let event = Event::new(&ty);
        let w = worker("w");

        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.await_zero().await })
        };
        latch.handle(&w, &w, DeliveryStatus::Ok, &event);
        latch.handle(&w, &w, DeliveryStatus::Ok, &event);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("latch should complete")
            .unwrap();
    }
}
