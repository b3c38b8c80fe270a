//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Request admitted
//!     → LoadBalancer::next_server()
//!         → registry.rs (snapshot of alive backends)
//!         → Apply selection algorithm:
//!             - round_robin.rs (rotate through backends)
//!             - random.rs (uniform pick)
//!             - least_conn.rs (pick backend with fewest connections)
//!     → backend.rs (connection guard held for the request lifetime)
//!     → None when nothing is alive ("no capacity", not an error)
//! ```
//!
//! # Design Decisions
//! - Strategies compose one shared `BackendRegistry`; the locking lives there
//! - Strategies never touch connection counters, the forwarder does
//! - Unhealthy backends excluded from selection

pub mod backend;
pub mod least_conn;
pub mod random;
pub mod registry;
pub mod round_robin;
pub mod strategy;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use url::Url;

pub use backend::{Backend, BackendConnectionGuard};
pub use least_conn::LeastConnections;
pub use random::Random;
pub use registry::{BackendList, BackendRegistry};
pub use round_robin::RoundRobin;
pub use strategy::{Strategy, UnknownStrategy};

/// Capability set shared by every selection strategy.
///
/// Only `next_server` differs between implementations; everything else
/// delegates to the shared registry.
pub trait LoadBalancer: Debug + Send + Sync {
    /// Short name used in logs, e.g. `round-robin`.
    fn name(&self) -> &'static str;

    /// The registry this strategy selects from.
    fn registry(&self) -> &Arc<BackendRegistry>;

    /// Pick the next alive backend, or `None` if nothing is alive.
    fn next_server(&self) -> Option<Arc<Backend>>;

    fn mark_down(&self, backend: &Backend) {
        self.registry().mark_down(backend);
    }

    fn mark_up(&self, backend: &Backend) {
        self.registry().mark_up(backend);
    }

    fn update_backends(&self, backends: Vec<Arc<Backend>>) {
        self.registry().replace(backends);
    }

    fn backends(&self) -> BackendList {
        self.registry().list()
    }
}

/// Build backends for `urls`, reusing instances from `current` that share an
/// address so liveness and in-flight counts survive a reload.
pub fn reconcile_backends(current: &[Arc<Backend>], urls: &[Url]) -> Vec<Arc<Backend>> {
    let existing: HashMap<&str, &Arc<Backend>> =
        current.iter().map(|b| (b.address(), b)).collect();

    urls.iter()
        .map(|url| {
            let fresh = Backend::new(url.clone());
            match existing.get(fresh.address()) {
                Some(b) => Arc::clone(b),
                None => Arc::new(fresh),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_keeps_known_backends() {
        let a = Arc::new(Backend::new("http://a:1".parse().unwrap()));
        let b = Arc::new(Backend::new("http://b:1".parse().unwrap()));
        a.set_alive(false);
        let _g = a.connection_guard();

        let urls: Vec<Url> = ["http://a:1", "http://c:1"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let next = reconcile_backends(&[a.clone(), b], &urls);

        assert_eq!(next.len(), 2);
        assert!(Arc::ptr_eq(&next[0], &a));
        assert!(!next[0].is_alive());
        assert_eq!(next[0].active_connections(), 1);
        assert_eq!(next[1].address(), "http://c:1");
        assert!(next[1].is_alive());
    }
}
