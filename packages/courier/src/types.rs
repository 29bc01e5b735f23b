//! Event type registry.
//!
//! An [`EventType`] is a named, size-fixed payload template. Names are
//! unique per engine and registrations are append-only: once a name is
//! taken it keeps its size and payload layout for the engine's lifetime.
//!
//! Two layouts exist:
//! - **raw bytes** (`register_type`): the payload is a zero-filled byte
//!   buffer of exactly the registered size.
//! - **typed** (`register_typed::<T>`): the payload is a `T`, created with
//!   `T::default()`. Accessing it as anything but `T` is a
//!   [`CourierError::PayloadMismatch`], never a reinterpretation.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{CourierError, RegistryKind, Result};
use crate::event::Payload;

type PayloadInit = fn() -> Box<dyn Any + Send + Sync>;

fn init_default<T: Default + Send + Sync + 'static>() -> Box<dyn Any + Send + Sync> {
    Box::new(T::default())
}

#[derive(Clone, Copy)]
pub(crate) enum Layout {
    Bytes,
    Typed {
        type_id: TypeId,
        type_name: &'static str,
        init: PayloadInit,
    },
}

impl Layout {
    pub(crate) fn describe(&self) -> &'static str {
        match self {
            Layout::Bytes => "raw bytes",
            Layout::Typed { type_name, .. } => type_name,
        }
    }
}

struct EventTypeInner {
    id: u64,
    name: String,
    size: usize,
    layout: Layout,
}

/// Handle to a registered event type.
///
/// Handles are cheap to clone. Two handles compare equal only when they
/// come from the same registration.
#[derive(Clone)]
pub struct EventType {
    inner: Arc<EventTypeInner>,
}

impl EventType {
    /// Registered name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Registry-local numeric id, stable for the engine's lifetime.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// True if the payload is the typed view `T`.
    pub fn is<T: 'static>(&self) -> bool {
        matches!(self.inner.layout, Layout::Typed { type_id, .. } if type_id == TypeId::of::<T>())
    }

    pub(crate) fn layout(&self) -> Layout {
        self.inner.layout
    }

    pub(crate) fn new_payload(&self) -> Payload {
        match self.inner.layout {
            Layout::Bytes => Payload::Bytes(vec![0u8; self.inner.size]),
            Layout::Typed { init, .. } => Payload::Typed(init()),
        }
    }
}

impl PartialEq for EventType {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventType {}

impl Hash for EventType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventType")
            .field("name", &self.inner.name)
            .field("size", &self.inner.size)
            .field("layout", &self.inner.layout.describe())
            .finish()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

/// Name → [`EventType`] table.
#[derive(Default)]
pub struct TypeRegistry {
    types: DashMap<String, EventType>,
    next_id: AtomicU64,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw-bytes event type of `payload_size` bytes.
    ///
    /// Fails with `AlreadyExists` if the name is taken.
    pub fn register_type(&self, name: &str, payload_size: usize) -> Result<EventType> {
        self.insert(name, payload_size, Layout::Bytes)
    }

    /// Register an event type whose payload is a `T`.
    ///
    /// The registered size is `size_of::<T>()`.
    pub fn register_typed<T>(&self, name: &str) -> Result<EventType>
    where
        T: Default + Send + Sync + 'static,
    {
        let layout = Layout::Typed {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            init: init_default::<T>,
        };
        self.insert(name, std::mem::size_of::<T>(), layout)
    }

    /// Return the type registered under `name`, registering a raw-bytes
    /// type if there is none.
    ///
    /// An existing registration with a different size is `AlreadyExists`.
    pub fn get_or_register_type(&self, name: &str, payload_size: usize) -> Result<EventType> {
        match self.types.entry(name.to_string()) {
            Entry::Occupied(existing) if existing.get().size() == payload_size => {
                Ok(existing.get().clone())
            }
            Entry::Occupied(_) => Err(CourierError::already_exists(RegistryKind::EventType, name)),
            Entry::Vacant(slot) => {
                let ty = self.make(name, payload_size, Layout::Bytes);
                slot.insert(ty.clone());
                Ok(ty)
            }
        }
    }

    /// Look up a type by name.
    pub fn lookup_type(&self, name: &str) -> Result<EventType> {
        self.types
            .get(name)
            .map(|ty| ty.clone())
            .ok_or_else(|| CourierError::not_found(RegistryKind::EventType, name))
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    fn insert(&self, name: &str, size: usize, layout: Layout) -> Result<EventType> {
        match self.types.entry(name.to_string()) {
            Entry::Occupied(_) => Err(CourierError::already_exists(RegistryKind::EventType, name)),
            Entry::Vacant(slot) => {
                let ty = self.make(name, size, layout);
                slot.insert(ty.clone());
                debug!(event_type = name, size, layout = layout.describe(), "registered event type");
                Ok(ty)
            }
        }
    }

    fn make(&self, name: &str, size: usize, layout: Layout) -> EventType {
        EventType {
            inner: Arc::new(EventTypeInner {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                name: name.to_string(),
                size,
                layout,
            }),
        }
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("len", &self.types.len())
            .finish()
    }
}
