//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from the TOML file.
//! Durations are written in humantime form (`"500ms"`, `"10s"`, `"1m"`).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::load_balancer::{Strategy, UnknownStrategy};
use crate::security::{Limit, LimitError};

/// Root configuration for the load balancer.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct BalancerConfig {
    /// Listener configuration.
    pub server: ServerConfig,

    /// Backends and selection strategy.
    pub balancer: LoadBalancerConfig,

    /// Rate limiting configuration.
    pub rate_limiter: RateLimitConfig,

    /// Health check settings.
    pub health_check: HealthCheckConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Ordered backend base URLs, e.g. `http://127.0.0.1:3000`.
    pub backends: Vec<String>,

    /// `round-robin`, `random` or `least-connections`. Empty means round-robin.
    pub strategy: String,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            strategy: Strategy::default().as_str().to_string(),
        }
    }
}

impl LoadBalancerConfig {
    pub fn strategy(&self) -> Result<Strategy, UnknownStrategy> {
        self.strategy.parse()
    }

    /// Parsed backend URLs. Call after validation.
    pub fn backend_urls(&self) -> Result<Vec<Url>, url::ParseError> {
        self.backends.iter().map(|b| Url::parse(b)).collect()
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable the global and configured client limits.
    pub enabled: bool,

    /// How often every bucket is refilled in the background.
    #[serde(with = "humantime_duration")]
    pub refill_interval: Duration,

    /// Global limit: requests across all clients per `period`.
    pub rate: u32,

    #[serde(with = "humantime_duration")]
    pub period: Duration,

    /// Per-client overrides keyed by client id.
    pub clients: BTreeMap<String, ClientLimitConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            refill_interval: Duration::from_secs(1),
            rate: 100,
            period: Duration::from_secs(1),
            clients: BTreeMap::new(),
        }
    }
}

/// Limits to install: the global limit and the per-client overrides.
pub type ConfiguredLimits = (Option<Limit>, Vec<(String, Limit)>);

impl RateLimitConfig {
    /// The limits this configuration installs. Nothing when disabled.
    pub fn limits(&self) -> Result<ConfiguredLimits, LimitError> {
        if !self.enabled {
            return Ok((None, Vec::new()));
        }

        let global = Limit::new(self.rate, self.period)?;
        let clients = self
            .clients
            .iter()
            .map(|(id, c)| Ok((id.clone(), c.limit()?)))
            .collect::<Result<Vec<_>, LimitError>>()?;

        Ok((Some(global), clients))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ClientLimitConfig {
    pub rate: u32,

    #[serde(with = "humantime_duration")]
    pub period: Duration,
}

impl ClientLimitConfig {
    pub fn limit(&self) -> Result<Limit, LimitError> {
        Limit::new(self.rate, self.period)
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Health check interval.
    #[serde(with = "humantime_duration")]
    pub interval: Duration,

    /// Per-probe timeout.
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,

    /// Path to probe, appended to each backend address.
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            path: "/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins if set.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Client management endpoints.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token required on `/clients` and `/admin` routes when set.
    pub api_key: Option<String>,
}

/// Serde adapter for humantime duration strings.
pub mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
