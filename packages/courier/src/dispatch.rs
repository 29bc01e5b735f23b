//! Per-worker delivery loop.
//!
//! Each worker gets exactly one [`Dispatcher`] task. Loops of different
//! workers run in parallel; a single loop drains its inbox strictly in
//! order, which is what gives per-destination FIFO delivery.
//!
//! For each delivery the loop:
//! 1. moves the event `Queued → Delivering`,
//! 2. resolves the handler (type override, else the worker default),
//! 3. invokes it with `(source, destination, status, event)`,
//! 4. moves the event back to `Idle` and wakes anyone in `Event::idle`.
//!
//! A panicking handler is caught and logged; the event is still released
//! and the loop keeps running.

use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;
use tracing::{error, info, trace, warn};

use crate::event::EventState;
use crate::worker::{Delivery, Slot, Worker};

/// Outcome attached to a handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Normal delivery: posted without a deadline, or the deadline was
    /// reached.
    Ok,
    /// Delivery forced early by `cancel` or `flush`.
    Flush,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Ok => write!(f, "ok"),
            DeliveryStatus::Flush => write!(f, "flush"),
        }
    }
}

pub(crate) struct Dispatcher {
    worker: Worker,
}

impl Dispatcher {
    pub(crate) fn new(worker: Worker) -> Self {
        Self { worker }
    }

    /// Run until the task is aborted.
    pub(crate) async fn run(self) {
        info!(worker = %self.worker, "worker loop starting");
        loop {
            match self.worker.next().await {
                Slot::Deliver(delivery) => self.deliver(delivery),
                Slot::Barrier(done) => {
                    trace!(worker = %self.worker, "flush barrier reached");
                    // The flusher may have given up waiting; nothing to do then.
                    let _ = done.send(());
                }
            }
        }
    }

    fn deliver(&self, delivery: Delivery) {
        let Delivery {
            event,
            src,
            status,
            seq,
        } = delivery;

        if let Err(state) = event.transition(EventState::Queued, EventState::Delivering) {
            warn!(worker = %self.worker, event = %event.id(), %state, "dropping inbox entry for an event that is not queued");
            return;
        }

        let handler = self.worker.handler_for(event.event_type());
        trace!(
            worker = %self.worker,
            source = %src,
            event = %event.id(),
            event_type = %event.event_type(),
            %status,
            seq,
            "delivering"
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.handle(&src, &self.worker, status, &event)
        }));
        if let Err(panic) = outcome {
            let panic_msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(worker = %self.worker, event = %event.id(), panic = %panic_msg, "handler panicked");
            self.worker.record_panic();
        }

        self.worker.record(status);
        event.release();
    }
}
