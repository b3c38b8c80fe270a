//! Request forwarding to the selected backend.

pub mod forwarder;

pub use forwarder::{ForwardError, Forwarder};
