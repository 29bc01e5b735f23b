//! Event instances and their lifecycle state.
//!
//! An [`Event`] is allocated from an [`EventType`] and can be posted, delivered,
//! and posted again any number of times. At any moment it occupies at most
//! one in-flight slot:
//!
//! ```text
//!            post (no deadline / past)          pop by worker loop
//!   Idle ─────────────────────────────► Queued ───────────────► Delivering
//!    │ ▲                                  ▲                          │
//!    │ └──────────────────────────────────┼──────── handler returns ─┘
//!    │    post (future deadline)          │ deadline / cancel / flush
//!    └───────────────────────────► TimerPending
//! ```
//!
//! Every transition is a compare-and-swap on the state byte, so two
//! threads posting the same event race safely: exactly one wins and the
//! other gets `Busy` with nothing changed.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::dispatch::DeliveryStatus;
use crate::error::{CourierError, Result};
use crate::sync::lock;
use crate::timer::TimerKey;
use crate::types::EventType;
use crate::worker::{Delivery, Slot, Worker};

/// Unique id of an event instance, used in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Create a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Inner uuid.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Lifecycle state of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum EventState {
    /// Owned by the caller; may be posted.
    Idle = 0,
    /// In a worker's inbox, waiting for its turn.
    Queued = 1,
    /// Waiting in the timer queue for its deadline.
    TimerPending = 2,
    /// A handler is running with this event.
    Delivering = 3,
}

impl EventState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => EventState::Idle,
            1 => EventState::Queued,
            2 => EventState::TimerPending,
            _ => EventState::Delivering,
        }
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventState::Idle => write!(f, "idle"),
            EventState::Queued => write!(f, "queued"),
            EventState::TimerPending => write!(f, "timer-pending"),
            EventState::Delivering => write!(f, "delivering"),
        }
    }
}

pub(crate) enum Payload {
    Bytes(Vec<u8>),
    Typed(Box<dyn Any + Send + Sync>),
}

/// Where an event was last posted.
pub(crate) struct Route {
    pub(crate) src: Worker,
    pub(crate) dst: Worker,
    pub(crate) deadline: Option<Instant>,
    pub(crate) seq: u64,
}

impl Route {
    pub(crate) fn timer_key(&self) -> Option<TimerKey> {
        self.deadline.map(|deadline| TimerKey {
            deadline,
            seq: self.seq,
        })
    }
}

struct EventInner {
    id: EventId,
    event_type: EventType,
    state: AtomicU8,
    route: Mutex<Option<Route>>,
    payload: Mutex<Payload>,
    idle: Notify,
}

/// Handle to an allocated event.
///
/// Clones refer to the same instance; equality is identity.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    /// Allocate an idle event with a fresh payload for `event_type`.
    pub fn new(event_type: &EventType) -> Self {
        Self {
            inner: Arc::new(EventInner {
                id: EventId::new(),
                event_type: event_type.clone(),
                state: AtomicU8::new(EventState::Idle as u8),
                route: Mutex::new(None),
                payload: Mutex::new(event_type.new_payload()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> EventId {
        self.inner.id
    }

    pub fn event_type(&self) -> &EventType {
        &self.inner.event_type
    }

    /// Current lifecycle state (lock-free read).
    pub fn state(&self) -> EventState {
        EventState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_idle(&self) -> bool {
        self.state() == EventState::Idle
    }

    /// Source worker of the most recent successful post.
    pub fn source(&self) -> Option<Worker> {
        self.route().as_ref().map(|r| r.src.clone())
    }

    /// Destination worker of the most recent successful post.
    ///
    /// Kept after delivery, so it still answers "who won" once the event
    /// is idle again.
    pub fn destination(&self) -> Option<Worker> {
        self.route().as_ref().map(|r| r.dst.clone())
    }

    /// Deadline of the most recent successful post, if it had one in the
    /// future.
    pub fn deadline(&self) -> Option<Instant> {
        self.route().as_ref().and_then(|r| r.deadline)
    }

    /// Wait until the event is back in the caller's hands.
    ///
    /// Returns immediately if the event is already idle.
    pub async fn idle(&self) {
        loop {
            // Register before checking so a reset between the check and the
            // await is not missed.
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Run `f` over the raw payload bytes.
    ///
    /// Fails with `PayloadMismatch` if the type was registered as typed.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut payload = lock(&self.inner.payload, "event payload");
        match &mut *payload {
            Payload::Bytes(bytes) => Ok(f(bytes.as_mut_slice())),
            Payload::Typed(_) => Err(self.mismatch("raw bytes")),
        }
    }

    /// Run `f` over the typed payload.
    ///
    /// Fails with `PayloadMismatch` unless the type was registered with
    /// `register_typed::<T>`.
    pub fn with_data<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut payload = lock(&self.inner.payload, "event payload");
        let data = match &mut *payload {
            Payload::Typed(data) => (**data).downcast_mut::<T>(),
            Payload::Bytes(_) => None,
        };
        match data {
            Some(data) => Ok(f(data)),
            None => Err(self.mismatch(std::any::type_name::<T>())),
        }
    }

    /// Copy the typed payload out.
    pub fn data<T: Clone + 'static>(&self) -> Result<T> {
        self.with_data(|data: &mut T| data.clone())
    }

    /// Replace the typed payload.
    pub fn set_data<T: 'static>(&self, value: T) -> Result<()> {
        self.with_data(|data: &mut T| *data = value)
    }

    fn mismatch(&self, requested: &'static str) -> CourierError {
        CourierError::PayloadMismatch {
            event_type: self.inner.event_type.name().to_string(),
            actual: self.inner.event_type.layout().describe(),
            requested,
        }
    }

    pub(crate) fn route(&self) -> MutexGuard<'_, Option<Route>> {
        lock(&self.inner.route, "event route")
    }

    /// Compare-and-swap the state byte. On failure returns the state that
    /// was actually observed.
    pub(crate) fn transition(&self, from: EventState, to: EventState) -> Result<(), EventState> {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(EventState::from_u8)
    }

    /// Return a delivered event to its owner.
    pub(crate) fn release(&self) {
        if let Err(state) = self.transition(EventState::Delivering, EventState::Idle) {
            tracing::warn!(event = %self.id(), %state, "released an event that was not delivering");
        }
        self.inner.idle.notify_waiters();
    }

    /// Hand back an event whose delivery was refused or dropped by a
    /// stopped worker.
    pub(crate) fn abandon(&self) {
        if let Err(state) = self.transition(EventState::Queued, EventState::Idle) {
            tracing::warn!(event = %self.id(), %state, "abandoned an event that was not queued");
        }
        self.inner.idle.notify_waiters();
    }

    /// Take a timer-pending event out of the waiting set, leaving it
    /// `Queued`. The caller must place the returned delivery in the
    /// returned worker's inbox, or [`abandon`](Event::abandon) it.
    ///
    /// `seq` must match the post that scheduled it; anything else means the
    /// timer entry is stale and nothing happens.
    pub(crate) fn take_pending(
        &self,
        seq: u64,
        status: DeliveryStatus,
    ) -> Option<(Worker, Delivery)> {
        let guard = self.route();
        let route = guard.as_ref().filter(|r| r.seq == seq)?;
        self.transition(EventState::TimerPending, EventState::Queued).ok()?;
        let delivery = Delivery {
            event: self.clone(),
            src: route.src.clone(),
            status,
            seq,
        };
        Some((route.dst.clone(), delivery))
    }

    /// Move a timer-pending event to the tail of its destination's inbox.
    pub(crate) fn promote(&self, seq: u64, status: DeliveryStatus) -> Promotion {
        let Some((dst, delivery)) = self.take_pending(seq, status) else {
            return Promotion::Stale;
        };
        if dst.push(Slot::Deliver(delivery)) {
            Promotion::Enqueued
        } else {
            self.abandon();
            Promotion::Refused
        }
    }
}

/// Outcome of [`Event::promote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Promotion {
    Enqueued,
    /// The timer entry belonged to an earlier post.
    Stale,
    /// The destination is stopped; the event is idle again.
    Refused,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Event {}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.inner.id)
            .field("type", &self.inner.event_type.name())
            .field("state", &self.state())
            .finish()
    }
}
