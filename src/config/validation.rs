//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate backend URLs, strategy name, limits and intervals
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BalancerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use url::Url;

use crate::config::schema::BalancerConfig;
use crate::load_balancer::UnknownStrategy;
use crate::security::{LimitError, GLOBAL_KEY};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid bind address {0:?}")]
    BindAddress(String),
    #[error("no backends configured")]
    NoBackends,
    #[error("invalid backend {address:?}: {reason}")]
    Backend { address: String, reason: String },
    #[error("duplicate backend {0:?}")]
    DuplicateBackend(String),
    #[error(transparent)]
    Strategy(#[from] UnknownStrategy),
    #[error("invalid rate limit for {key:?}: {source}")]
    Limit { key: String, source: LimitError },
    #[error("client id {0:?} is reserved")]
    ReservedClientId(String),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("health check path must start with '/': {0:?}")]
    HealthPath(String),
    #[error("invalid metrics address {0:?}")]
    MetricsAddress(String),
}

pub fn validate_config(config: &BalancerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.server.bind_address.clone()));
    }

    validate_backends(&config.balancer.backends, &mut errors);

    if let Err(e) = config.balancer.strategy() {
        errors.push(e.into());
    }

    let limits = &config.rate_limiter;
    if limits.enabled {
        if let Err(source) = crate::security::Limit::new(limits.rate, limits.period) {
            errors.push(ValidationError::Limit {
                key: GLOBAL_KEY.to_string(),
                source,
            });
        }
    }
    // Client overrides are checked even when disabled so a later enable cannot
    // surface a broken file.
    for (id, client) in &limits.clients {
        if id == GLOBAL_KEY {
            errors.push(ValidationError::ReservedClientId(id.clone()));
        }
        if let Err(source) = client.limit() {
            errors.push(ValidationError::Limit {
                key: id.clone(),
                source,
            });
        }
    }
    check_duration(limits.refill_interval, "rate_limiter.refill_interval", &mut errors);

    let health = &config.health_check;
    if health.enabled {
        check_duration(health.interval, "health_check.interval", &mut errors);
        check_duration(health.timeout, "health_check.timeout", &mut errors);
        if !health.path.starts_with('/') {
            errors.push(ValidationError::HealthPath(health.path.clone()));
        }
    }

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_backends(backends: &[String], errors: &mut Vec<ValidationError>) {
    if backends.is_empty() {
        errors.push(ValidationError::NoBackends);
        return;
    }

    let mut seen = HashSet::new();
    for address in backends {
        let invalid = |reason: String| ValidationError::Backend {
            address: address.clone(),
            reason,
        };

        match Url::parse(address) {
            Ok(url) if url.scheme() != "http" => {
                errors.push(invalid(format!("unsupported scheme {:?}", url.scheme())));
            }
            Ok(url) if url.host_str().is_none() => {
                errors.push(invalid("missing host".to_string()));
            }
            Ok(url) if url.query().is_some() || url.fragment().is_some() => {
                errors.push(invalid("query and fragment are not allowed".to_string()));
            }
            Ok(_) => {
                if !seen.insert(address.trim_end_matches('/')) {
                    errors.push(ValidationError::DuplicateBackend(address.clone()));
                }
            }
            Err(e) => errors.push(invalid(e.to_string())),
        }
    }
}

fn check_duration(value: Duration, field: &'static str, errors: &mut Vec<ValidationError>) {
    if value.is_zero() {
        errors.push(ValidationError::ZeroDuration(field));
    }
}
