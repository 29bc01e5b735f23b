//! # Courier
//!
//! An actor-style event dispatch engine: named workers with ordered inboxes
//! exchange reusable, typed events, delivered immediately, at an absolute
//! deadline, or early on cancel/flush.
//!
//! ## Core Concepts
//!
//! - [`EventType`] = a named payload layout (raw bytes or a Rust type)
//! - [`Event`] = a reusable instance of a type, in flight at most once
//! - [`Worker`] = a named actor with a FIFO inbox and a handler table
//! - [`Engine`] = the registries, the timer loop, and one delivery loop
//!   per worker
//!
//! ## Architecture
//!
//! ```text
//! caller threads
//!     │
//!     ├─ post(src, dst, event, None) ──────────────────────────┐
//!     │                                                        │
//!     ├─ post(src, dst, event, Some(deadline)) ─► TimerQueue   │
//!     │                                             │          │
//!     │                           deadline reached ─┤ (Ok)     │
//!     ├─ cancel(event) ─────────────────────────────┤ (Flush)  │
//!     ├─ flush(worker) ─────────────────────────────┘ (Flush)  │
//!     │                                             │          │
//!     │                                             ▼          ▼
//!     │                                        Worker inbox (FIFO)
//!     │                                             │
//!     │                                             ▼
//!     │                                        Dispatcher loop
//!     │                                             │
//!     │                         handler(src, dst, status, event)
//!     │                                             │
//!     └──────────────── event.idle() ◄── event back to Idle
//! ```
//!
//! ## Guarantees
//!
//! - **At most one in flight**: of several racing posts of one event,
//!   exactly one succeeds; the rest get `Busy` and change nothing
//! - **FIFO per destination** for events posted without a deadline
//! - **Never early**: a deadline event is delivered at or after its
//!   deadline, normally within a millisecond, equal deadlines in post order
//! - **Explicit status**: `Ok` for normal delivery, `Flush` for delivery
//!   forced by cancel or flush
//! - **In-memory only**: nothing survives the process
//!
//! ## Example
//!
//! ```ignore
//! use courier::{deadline_from_now, DeliveryStatus, Engine, Event, Worker};
//!
//! #[derive(Debug, Default, Clone)]
//! struct Order { id: u32 }
//!
//! let engine = Engine::new()?;
//! let ty = engine.register_typed::<Order>("order")?;
//! let src = engine.register_worker("intake", |_: &Worker, _: &Worker, _: DeliveryStatus, _: &Event| {})?;
//! let dst = engine.register_worker("billing", |src: &Worker, _: &Worker, status: DeliveryStatus, e: &Event| {
//!     let order = e.data::<Order>().unwrap_or_default();
//!     tracing::info!(from = src.name(), %status, order = order.id, "billing");
//! })?;
//!
//! let event = engine.new_event(&ty);
//! event.set_data(Order { id: 7 })?;
//! engine.post(&src, &dst, &event, Some(deadline_from_now(2, 0)))?;
//! engine.flush(&dst).await?; // delivered now, with status Flush
//! ```

mod config;
mod dispatch;
mod engine;
mod error;
mod event;
mod registry;
mod sync;
mod time;
mod timer;
mod types;
mod worker;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export engine types (primary entry point)
pub use engine::{Engine, EngineBuilder};

// Re-export configuration
pub use config::{EngineConfig, DEFAULT_TIMER_SLACK, TIMER_SLACK_ENV};

// Re-export error types
pub use error::{CourierError, RegistryKind, Result};

// Re-export registry types
pub use registry::WorkerRegistry;
pub use types::{EventType, TypeRegistry};

// Re-export event and worker types
pub use dispatch::DeliveryStatus;
pub use event::{Event, EventId, EventState};
pub use worker::{Handler, Worker, WorkerStats};

// Re-export time helpers
pub use time::{deadline_from_now, time_diff};
