//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer
//!     → Probe every backend concurrently (GET address + path)
//!     → 2xx marks up, anything else marks down
//!
//! Passive demotion (proxy::forwarder):
//!     Transport failure on a proxied request
//!     → mark down immediately, next successful probe heals
//! ```
//!
//! # Design Decisions
//! - One probe failure is enough to demote, one success to restore
//! - Health state is per-backend, not per-pool
//! - Shutdown waits for in-flight probes before reporting the loop stopped

pub mod active;

pub use active::{HealthMonitor, ProbeError};
