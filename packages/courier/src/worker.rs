//! Workers: named actors with an ordered inbox and a handler table.
//!
//! A worker owns:
//! - a FIFO inbox of events ready for delivery,
//! - a table mapping event type → [`Handler`],
//! - a default handler used for every type without an override.
//!
//! Deadline events destined for a worker wait in the engine's timer queue
//! and only enter the inbox once due (or when forced by cancel/flush).

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tracing::trace;
use uuid::Uuid;

use crate::dispatch::DeliveryStatus;
use crate::event::Event;
use crate::sync::lock;
use crate::types::EventType;

/// Capability invoked for every delivered event.
///
/// Handlers observe; their outcome has no effect on routing. Any
/// `Fn(&Worker, &Worker, DeliveryStatus, &Event)` closure is a handler:
///
/// ```ignore
/// let dst = engine.register_worker("generic_dst", |src: &Worker, dst: &Worker, status, event: &Event| {
///     tracing::info!(from = src.name(), to = dst.name(), ?status, event = %event.id(), "delivered");
/// })?;
/// ```
///
/// The event is in the `Delivering` state for the duration of the call and
/// becomes idle when the handler returns, so a handler cannot repost the
/// event it was given.
pub trait Handler: Send + Sync + 'static {
    /// Handle one delivery from `src` to `dst`.
    fn handle(&self, src: &Worker, dst: &Worker, status: DeliveryStatus, event: &Event);
}

impl<F> Handler for F
where
    F: Fn(&Worker, &Worker, DeliveryStatus, &Event) + Send + Sync + 'static,
{
    fn handle(&self, src: &Worker, dst: &Worker, status: DeliveryStatus, event: &Event) {
        self(src, dst, status, event)
    }
}

/// An event ready for its handler.
pub(crate) struct Delivery {
    pub(crate) event: Event,
    pub(crate) src: Worker,
    pub(crate) status: DeliveryStatus,
    pub(crate) seq: u64,
}

/// One inbox entry.
pub(crate) enum Slot {
    Deliver(Delivery),
    /// Flush barrier: signalled when every entry ahead of it is delivered.
    Barrier(oneshot::Sender<()>),
}

/// Point-in-time counters for a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Events currently in the inbox.
    pub queued: usize,
    /// Deliveries made with [`DeliveryStatus::Ok`].
    pub delivered_ok: u64,
    /// Deliveries forced with [`DeliveryStatus::Flush`].
    pub delivered_flush: u64,
    /// Handler invocations that panicked.
    pub handler_panics: u64,
}

#[derive(Default)]
struct Counters {
    delivered_ok: AtomicU64,
    delivered_flush: AtomicU64,
    handler_panics: AtomicU64,
}

struct WorkerInner {
    id: Uuid,
    name: String,
    default_handler: Arc<dyn Handler>,
    handlers: DashMap<u64, Arc<dyn Handler>>,
    inbox: Mutex<VecDeque<Slot>>,
    wake: Notify,
    closed: AtomicBool,
    counters: Counters,
}

/// Handle to a registered worker.
///
/// Clones refer to the same worker; equality is identity.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub(crate) fn new(name: &str, default_handler: Arc<dyn Handler>) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                id: Uuid::new_v4(),
                name: name.to_string(),
                default_handler,
                handlers: DashMap::new(),
                inbox: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                closed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// True once the owning engine has shut down. A closed worker accepts
    /// no deliveries.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Snapshot of this worker's counters.
    pub fn stats(&self) -> WorkerStats {
        let queued = lock(&self.inner.inbox, "worker inbox")
            .iter()
            .filter(|slot| matches!(slot, Slot::Deliver(_)))
            .count();
        let counters = &self.inner.counters;
        WorkerStats {
            queued,
            delivered_ok: counters.delivered_ok.load(Ordering::Relaxed),
            delivered_flush: counters.delivered_flush.load(Ordering::Relaxed),
            handler_panics: counters.handler_panics.load(Ordering::Relaxed),
        }
    }

    /// True if a type-specific handler is installed for `event_type`.
    pub fn has_handler(&self, event_type: &EventType) -> bool {
        self.inner.handlers.contains_key(&event_type.id())
    }

    pub(crate) fn set_handler(&self, event_type: &EventType, handler: Arc<dyn Handler>) {
        self.inner.handlers.insert(event_type.id(), handler);
    }

    pub(crate) fn clear_handler(&self, event_type: &EventType) -> bool {
        self.inner.handlers.remove(&event_type.id()).is_some()
    }

    /// Type-specific handler if one is installed, else the default.
    pub(crate) fn handler_for(&self, event_type: &EventType) -> Arc<dyn Handler> {
        self.inner
            .handlers
            .get(&event_type.id())
            .map(|h| Arc::clone(h.value()))
            .unwrap_or_else(|| Arc::clone(&self.inner.default_handler))
    }

    /// Append to the tail of the inbox and wake the worker loop.
    ///
    /// Returns false if the worker is closed, in which case the slot is
    /// dropped: the caller owns rolling back a refused delivery, and a
    /// dropped barrier reports `WorkerStopped` to its flusher.
    pub(crate) fn push(&self, slot: Slot) -> bool {
        let mut inbox = lock(&self.inner.inbox, "worker inbox");
        if self.is_closed() {
            trace!(worker = %self, "refusing slot for closed worker");
            return false;
        }
        inbox.push_back(slot);
        drop(inbox);
        self.inner.wake.notify_one();
        true
    }

    /// Force everything in the inbox for a flush.
    ///
    /// Every delivery still waiting in the inbox is re-marked
    /// [`DeliveryStatus::Flush`], `forced` is appended after them in order,
    /// and `barrier` goes last. Returns how many queued deliveries were
    /// re-marked, or hands `forced` back if the worker is closed.
    pub(crate) fn force<I>(&self, forced: I, barrier: oneshot::Sender<()>) -> Result<usize, I>
    where
        I: IntoIterator<Item = Delivery>,
    {
        let mut inbox = lock(&self.inner.inbox, "worker inbox");
        if self.is_closed() {
            return Err(forced);
        }
        let mut remarked = 0;
        for slot in inbox.iter_mut() {
            if let Slot::Deliver(delivery) = slot {
                if delivery.status == DeliveryStatus::Ok {
                    delivery.status = DeliveryStatus::Flush;
                    remarked += 1;
                }
            }
        }
        inbox.extend(forced.into_iter().map(Slot::Deliver));
        inbox.push_back(Slot::Barrier(barrier));
        drop(inbox);
        self.inner.wake.notify_one();
        Ok(remarked)
    }

    /// Stop accepting slots and drop everything still queued, handing the
    /// abandoned events back to their owners. Returns how many were
    /// abandoned.
    pub(crate) fn close(&self) -> usize {
        let mut inbox = lock(&self.inner.inbox, "worker inbox");
        self.inner.closed.store(true, Ordering::Release);
        let abandoned: Vec<Slot> = inbox.drain(..).collect();
        drop(inbox);
        abandoned
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Deliver(delivery) => Some(delivery.event),
                Slot::Barrier(_) => None,
            })
            .inspect(Event::abandon)
            .count()
    }

    /// Wait for the next inbox entry.
    pub(crate) async fn next(&self) -> Slot {
        loop {
            let slot = lock(&self.inner.inbox, "worker inbox").pop_front();
            if let Some(slot) = slot {
                return slot;
            }
            // `notify_one` stores a permit when nobody is waiting, so a push
            // between the pop above and this await still wakes us.
            self.inner.wake.notified().await;
        }
    }

    pub(crate) fn record(&self, status: DeliveryStatus) {
        let counter = match status {
            DeliveryStatus::Ok => &self.inner.counters.delivered_ok,
            DeliveryStatus::Flush => &self.inner.counters.delivered_flush,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_panic(&self) {
        self.inner
            .counters
            .handler_panics
            .fetch_add(1, Ordering::Relaxed);
    }
}

impl PartialEq for Worker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Worker {}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.inner.name)
            .field("handlers", &self.inner.handlers.len())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}
