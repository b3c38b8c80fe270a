//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (resolve client id, admission check)
//!         → global bucket, then the client's own bucket (token_bucket.rs)
//!     → 429 on rejection, otherwise pass to the forwarder
//!
//! Background:
//!     refill.rs ticks → RateLimiter::refill_all
//!
//! Administration:
//!     /clients → set_client_limit / remove_client_limit
//!         → client_settings.rs (persisted overrides)
//! ```
//!
//! # Design Decisions
//! - One lock per limiter; admission does no I/O under it
//! - Overrides live apart from buckets so buckets can be rebuilt
//! - Invalid rate/period rejected when building a `Limit`, never in the bucket

pub mod client_settings;
pub mod rate_limit;
pub mod refill;
pub mod token_bucket;

pub use rate_limit::{RateLimiter, GLOBAL_KEY};
pub use refill::TokenRefill;
pub use token_bucket::{Limit, LimitError, TokenBucket};
