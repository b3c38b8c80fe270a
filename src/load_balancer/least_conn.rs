//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::Backend, BackendRegistry, LoadBalancer};

/// Least connections selector.
/// Selects the alive backend with the minimum number of active connections.
#[derive(Debug)]
pub struct LeastConnections {
    registry: Arc<BackendRegistry>,
}

impl LeastConnections {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry }
    }
}

impl LoadBalancer for LeastConnections {
    fn name(&self) -> &'static str {
        "least-connections"
    }

    fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    fn next_server(&self) -> Option<Arc<Backend>> {
        // In case of tie, the first one is selected (stability)
        self.registry
            .available()
            .into_iter()
            .min_by_key(|b| b.active_connections())
    }
}
