//! Shared backend registry.
//!
//! # Responsibilities
//! - Own the ordered backend list shared by every strategy
//! - Hand out consistent snapshots to readers
//! - Swap the whole list atomically on reconfiguration
//! - Flip liveness on behalf of the prober and the forwarder

use std::sync::{Arc, PoisonError, RwLock};

use crate::load_balancer::backend::Backend;

/// Snapshot of the backend list. Cheap to clone, never mutated in place.
pub type BackendList = Arc<[Arc<Backend>]>;

/// Read-mostly, atomically swappable list of backends.
///
/// The lock only guards the list pointer. Readers clone the `Arc` and
/// release the lock immediately, so a reader never waits longer than an
/// in-progress swap.
#[derive(Debug)]
pub struct BackendRegistry {
    backends: RwLock<BackendList>,
}

impl BackendRegistry {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            backends: RwLock::new(backends.into()),
        }
    }

    /// Current snapshot of all backends, in configuration order.
    pub fn list(&self) -> BackendList {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whole list. Readers see either the old or the new list.
    pub fn replace(&self, backends: Vec<Arc<Backend>>) {
        let next: BackendList = backends.into();
        *self.backends.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Backends currently marked alive, in configuration order. May be empty.
    pub fn available(&self) -> Vec<Arc<Backend>> {
        self.list()
            .iter()
            .filter(|b| b.is_alive())
            .cloned()
            .collect()
    }

    /// Mark a backend down. Idempotent.
    pub fn mark_down(&self, backend: &Backend) {
        if backend.set_alive(false) {
            tracing::warn!(backend = %backend.address(), "Backend marked down");
        }
    }

    /// Mark a backend up. Idempotent.
    pub fn mark_up(&self, backend: &Backend) {
        if backend.set_alive(true) {
            tracing::info!(backend = %backend.address(), "Backend marked up");
        }
    }
}
