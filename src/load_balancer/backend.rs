//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single upstream server
//! - Track active connections (for Least Connections LB)
//! - Track liveness (alive/down), flipped by probes and by the forwarder

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

/// A single backend server.
///
/// Liveness and the connection counter are independent atomics, so reading
/// one backend never contends with writers on another.
pub struct Backend {
    /// Base address without a trailing slash, e.g. `http://10.0.0.1:8080`.
    address: String,
    alive: AtomicBool,
    active_connections: AtomicUsize,
}

impl Backend {
    /// Create a new backend. Backends start alive.
    pub fn new(url: Url) -> Self {
        let address = url.as_str().trim_end_matches('/').to_string();
        Self {
            address,
            alive: AtomicBool::new(true),
            active_connections: AtomicUsize::new(0),
        }
    }

    /// Base address, used as the prefix for forwarded and probe URIs.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Set liveness. Returns `true` if the flag actually changed.
    pub fn set_alive(&self, alive: bool) -> bool {
        self.alive.swap(alive, Ordering::AcqRel) != alive
    }

    /// Get the current number of active connections.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Start tracking one in-flight request.
    ///
    /// The count is released when the returned guard drops, on every exit
    /// path including cancellation and unwinding.
    pub fn connection_guard(self: &Arc<Self>) -> BackendConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        BackendConnectionGuard {
            backend: self.clone(),
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("address", &self.address)
            .field("alive", &self.is_alive())
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

/// A RAII guard that manages the active connection count.
#[derive(Debug)]
pub struct BackendConnectionGuard {
    backend: Arc<Backend>,
}

impl Deref for BackendConnectionGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for BackendConnectionGuard {
    fn drop(&mut self) {
        // Only guards decrement, and each guard incremented exactly once.
        self.backend.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(addr: &str) -> Arc<Backend> {
        Arc::new(Backend::new(addr.parse().unwrap()))
    }

    #[test]
    fn address_has_no_trailing_slash() {
        let b = backend("http://127.0.0.1:8080");
        assert_eq!(b.address(), "http://127.0.0.1:8080");
        assert!(b.is_alive());
    }

    #[test]
    fn set_alive_reports_transitions_only() {
        let b = backend("http://127.0.0.1:8080");
        assert!(!b.set_alive(true));
        assert!(b.set_alive(false));
        assert!(!b.set_alive(false));
        assert!(!b.is_alive());
        assert!(b.set_alive(true));
    }

    #[test]
    fn guard_releases_connection_on_drop() {
        let b = backend("http://127.0.0.1:8080");
        let g1 = b.connection_guard();
        let g2 = b.connection_guard();
        assert_eq!(b.active_connections(), 2);
        drop(g1);
        assert_eq!(b.active_connections(), 1);
        drop(g2);
        assert_eq!(b.active_connections(), 0);
    }

    #[test]
    fn guard_releases_connection_on_panic() {
        let b = backend("http://127.0.0.1:8080");
        let b2 = b.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = b2.connection_guard();
            panic!("upstream blew up");
        });
        assert!(result.is_err());
        assert_eq!(b.active_connections(), 0);
    }
}
