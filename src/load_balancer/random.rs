//! Random load balancing strategy.

use std::sync::Arc;

use rand::Rng;

use crate::load_balancer::{backend::Backend, BackendRegistry, LoadBalancer};

/// Uniform random selector over the alive backends.
#[derive(Debug)]
pub struct Random {
    registry: Arc<BackendRegistry>,
}

impl Random {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry }
    }
}

impl LoadBalancer for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    fn next_server(&self) -> Option<Arc<Backend>> {
        let available = self.registry.available();
        if available.is_empty() {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..available.len());
        Some(available[index].clone())
    }
}
