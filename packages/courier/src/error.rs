//! Structured error types for courier.
//!
//! Every engine operation returns an explicit [`Result`]; nothing fails
//! silently and nothing is retried by the engine. Retry policy belongs to
//! the caller:
//!
//! ```ignore
//! use courier::CourierError;
//!
//! match engine.post(&src, &dst, &event, None) {
//!     Ok(()) => {}
//!     // Still in flight: wait for ownership to come back, then repost.
//!     Err(e) if e.is_busy() => {
//!         event.idle().await;
//!         engine.post(&src, &dst, &event, None)?;
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::fmt;

use thiserror::Error;

use crate::event::{EventId, EventState};

/// Which registry an `AlreadyExists` / `NotFound` error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    /// The event type registry.
    EventType,
    /// The worker registry.
    Worker,
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryKind::EventType => write!(f, "event type"),
            RegistryKind::Worker => write!(f, "worker"),
        }
    }
}

/// Pattern-matchable errors for every engine operation.
#[derive(Debug, Error)]
pub enum CourierError {
    /// A type or worker name was registered twice.
    ///
    /// The existing registration is left untouched.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Registry the name collided in.
        kind: RegistryKind,
        /// The duplicate name.
        name: String,
    },

    /// Lookup of a name that was never registered.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Registry that was searched.
        kind: RegistryKind,
        /// The unknown name.
        name: String,
    },

    /// `post` on an event that is already in flight.
    ///
    /// The event's state and recorded route are unchanged.
    #[error("event {event} is busy ({state})")]
    Busy {
        /// The contended event.
        event: EventId,
        /// State observed by the losing post.
        state: EventState,
    },

    /// `cancel` on an event that is not waiting on a deadline.
    #[error("event {event} is not timer-pending ({state})")]
    NotPending {
        /// The event that could not be cancelled.
        event: EventId,
        /// State observed by the cancel.
        state: EventState,
    },

    /// The payload was accessed through a view that does not match its
    /// registered type.
    #[error("payload of event type '{event_type}' is {actual}, not {requested}")]
    PayloadMismatch {
        /// Registered event type name.
        event_type: String,
        /// What the payload actually is.
        actual: &'static str,
        /// What the caller asked for.
        requested: &'static str,
    },

    /// The engine was built outside of a tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// The engine has shut down: the worker accepts no deliveries, a
    /// pending flush will never complete, and no new workers start.
    #[error("worker '{worker}' is stopped")]
    WorkerStopped {
        /// Name of the stopped worker.
        worker: String,
    },

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CourierError {
    pub(crate) fn already_exists(kind: RegistryKind, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn not_found(kind: RegistryKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// True for [`CourierError::Busy`].
    pub fn is_busy(&self) -> bool {
        matches!(self, CourierError::Busy { .. })
    }

    /// True for [`CourierError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, CourierError::NotFound { .. })
    }

    /// True for [`CourierError::AlreadyExists`].
    pub fn is_already_exists(&self) -> bool {
        matches!(self, CourierError::AlreadyExists { .. })
    }

    /// True for [`CourierError::WorkerStopped`].
    pub fn is_stopped(&self) -> bool {
        matches!(self, CourierError::WorkerStopped { .. })
    }
}

/// Result alias used across the crate.
pub type Result<T, E = CourierError> = std::result::Result<T, E>;
