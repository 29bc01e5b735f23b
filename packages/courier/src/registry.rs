//! Worker registry: name → [`Worker`] lookup.
//!
//! Registration creates; lookup expects the worker to exist. The two are
//! deliberately asymmetric so a typo in a lookup surfaces as `NotFound`
//! instead of silently creating an orphan worker.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{CourierError, RegistryKind, Result};
use crate::worker::{Handler, Worker};

#[derive(Default)]
pub struct WorkerRegistry {
    workers: DashMap<String, Worker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a worker. Fails with `AlreadyExists` on a duplicate name and
    /// leaves the existing worker untouched.
    pub(crate) fn register(&self, name: &str, default_handler: Arc<dyn Handler>) -> Result<Worker> {
        match self.workers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(CourierError::already_exists(RegistryKind::Worker, name)),
            Entry::Vacant(slot) => {
                let worker = Worker::new(name, default_handler);
                slot.insert(worker.clone());
                Ok(worker)
            }
        }
    }

    /// Return the existing worker, or create one. The flag is true when the
    /// worker was created by this call.
    pub(crate) fn get_or_register(
        &self,
        name: &str,
        default_handler: impl FnOnce() -> Arc<dyn Handler>,
    ) -> (Worker, bool) {
        match self.workers.entry(name.to_string()) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(slot) => {
                let worker = Worker::new(name, default_handler());
                slot.insert(worker.clone());
                (worker, true)
            }
        }
    }

    /// Look up an existing worker.
    pub fn get(&self, name: &str) -> Result<Worker> {
        self.workers
            .get(name)
            .map(|w| w.clone())
            .ok_or_else(|| CourierError::not_found(RegistryKind::Worker, name))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Registered worker names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.iter().map(|w| w.key().clone()).collect();
        names.sort();
        names
    }

    pub(crate) fn all(&self) -> Vec<Worker> {
        self.workers.iter().map(|w| w.value().clone()).collect()
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.names())
            .finish()
    }
}
