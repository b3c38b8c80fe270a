//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, BackendRegistry, LoadBalancer};

/// Round-robin selector.
///
/// The index is taken modulo the *current* alive list, which is recomputed on
/// every call. When backends flap the rotation is only locally consistent;
/// distribution across liveness changes is not guaranteed to be even.
#[derive(Debug)]
pub struct RoundRobin {
    registry: Arc<BackendRegistry>,
    current: AtomicUsize,
}

impl RoundRobin {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            current: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    fn next_server(&self) -> Option<Arc<Backend>> {
        let available = self.registry.available();
        if available.is_empty() {
            return None;
        }

        let len = available.len();
        // Read-modify-write in one step so concurrent callers get distinct indices.
        let previous = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some((cur + 1) % len)
            })
            .unwrap_or_else(|cur| cur);
        let index = (previous + 1) % len;

        Some(available[index].clone())
    }
}
