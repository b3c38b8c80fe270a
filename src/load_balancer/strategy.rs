//! Strategy selection from configuration.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::load_balancer::{
    BackendRegistry, LeastConnections, LoadBalancer, Random, RoundRobin,
};

/// The configured selection algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
}

/// Returned when the configured strategy name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported balancing strategy: {0:?}")]
pub struct UnknownStrategy(pub String);

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::Random => "random",
            Strategy::LeastConnections => "least-connections",
        }
    }

    /// Build the strategy over a shared registry.
    pub fn build(self, registry: Arc<BackendRegistry>) -> Arc<dyn LoadBalancer> {
        match self {
            Strategy::RoundRobin => Arc::new(RoundRobin::new(registry)),
            Strategy::Random => Arc::new(Random::new(registry)),
            Strategy::LeastConnections => Arc::new(LeastConnections::new(registry)),
        }
    }
}

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    /// An empty name falls back to round-robin.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "round-robin" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            "least-connections" => Ok(Strategy::LeastConnections),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
