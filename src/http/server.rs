//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build registry, strategy, forwarder and limiter from configuration
//! - Wire up middleware (request ID, tracing, body limit, rate limiting)
//! - Mount the client management routes, proxy everything else
//! - Run the health monitor and token refill next to the listener
//! - Apply reloaded configuration while serving

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware,
    response::Response,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::admin::setup_admin_router;
use crate::config::{validate_config, BalancerConfig, ConfigError, ValidationError};
use crate::health::HealthMonitor;
use crate::http::request::{propagate_request_id_layer, set_request_id_layer, RequestIdExt};
use crate::lifecycle::Shutdown;
use crate::load_balancer::{
    reconcile_backends, Backend, BackendRegistry, LoadBalancer, Strategy,
};
use crate::proxy::{ForwardError, Forwarder};
use crate::security::rate_limit::rate_limit_middleware;
use crate::security::{RateLimiter, TokenRefill, GLOBAL_KEY};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub forwarder: Forwarder,
    pub limiter: Arc<RateLimiter>,
    pub api_key: Option<Arc<str>>,
}

/// HTTP server for the load balancer.
pub struct HttpServer {
    config: BalancerConfig,
    strategy: Strategy,
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    ///
    /// Configured limits are installed immediately, so the limiter is usable
    /// before `run` is called.
    pub fn new(config: BalancerConfig) -> Result<Self, ConfigError> {
        validate_config(&config).map_err(ConfigError::Validation)?;
        let invalid = |e: ValidationError| ConfigError::Validation(vec![e]);

        let strategy = config
            .balancer
            .strategy()
            .map_err(|e| invalid(e.into()))?;
        let urls = config.balancer.backend_urls().map_err(|e| {
            invalid(ValidationError::Backend {
                address: config.balancer.backends.join(", "),
                reason: e.to_string(),
            })
        })?;
        let (global, clients) = config.rate_limiter.limits().map_err(|source| {
            invalid(ValidationError::Limit {
                key: GLOBAL_KEY.to_string(),
                source,
            })
        })?;

        let backends = urls.into_iter().map(|u| Arc::new(Backend::new(u))).collect();
        let registry = Arc::new(BackendRegistry::new(backends));
        let balancer = strategy.build(registry);

        let limiter = Arc::new(RateLimiter::with_refill_interval(
            config.rate_limiter.refill_interval,
        ));
        limiter.reconfigure(global, &clients);

        tracing::info!(
            strategy = balancer.name(),
            backends = config.balancer.backends.len(),
            rate_limited = config.rate_limiter.enabled,
            "Load balancer configured"
        );

        let state = AppState {
            forwarder: Forwarder::new(balancer),
            limiter,
            api_key: config.admin.api_key.as_deref().map(Arc::from),
        };

        Ok(Self {
            config,
            strategy,
            state,
        })
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.state.limiter
    }

    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        self.state.forwarder.balancer()
    }

    /// Build the Axum router with all middleware layers.
    pub fn router(&self) -> Router {
        let state = self.state.clone();

        setup_admin_router(state.clone())
            .fallback(proxy_handler)
            .layer(middleware::from_fn_with_state(
                state.limiter.clone(),
                rate_limit_middleware,
            ))
            .layer(RequestBodyLimitLayer::new(self.config.server.max_body_bytes))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id = %request.request_id(),
                    )
                }),
            )
            .layer(propagate_request_id_layer())
            .layer(set_request_id_layer())
            .with_state(state)
    }

    /// Serve until `shutdown` fires.
    ///
    /// Background tasks are stopped and awaited before this returns, so
    /// nothing mutates the registry or limiter afterwards.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<BalancerConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let tasks = Shutdown::new();
        let balancer = self.balancer().clone();
        let handles = [
            HealthMonitor::new(balancer.registry().clone(), self.config.health_check.clone())
                .spawn(tasks.subscribe()),
            TokenRefill::new(self.limiter().clone(), self.config.rate_limiter.refill_interval)
                .spawn(tasks.subscribe()),
            Reloader {
                balancer,
                limiter: self.limiter().clone(),
                strategy: self.strategy,
            }
            .spawn(config_updates, tasks.subscribe()),
        ];

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server draining connections");
            })
            .await;

        tasks.trigger();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background task failed");
            }
        }

        tracing::info!("HTTP server stopped");
        served
    }
}

async fn proxy_handler(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Result<Response, ForwardError> {
    state.forwarder.forward(request).await
}

/// Applies reloaded configuration to the running balancer and limiter.
struct Reloader {
    balancer: Arc<dyn LoadBalancer>,
    limiter: Arc<RateLimiter>,
    strategy: Strategy,
}

impl Reloader {
    fn spawn(
        self,
        updates: mpsc::UnboundedReceiver<BalancerConfig>,
        shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(updates, shutdown))
    }

    async fn run(
        self,
        mut updates: mpsc::UnboundedReceiver<BalancerConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(config) => self.apply(&config),
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
    }

    fn apply(&self, config: &BalancerConfig) {
        match config.balancer.strategy() {
            Ok(strategy) if strategy != self.strategy => tracing::warn!(
                running = self.strategy.as_str(),
                configured = strategy.as_str(),
                "Strategy change requires a restart, keeping the running strategy"
            ),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Ignoring reloaded strategy"),
        }

        match config.balancer.backend_urls() {
            Ok(urls) => {
                let next = reconcile_backends(&self.balancer.backends(), &urls);
                self.balancer.update_backends(next);
                tracing::info!(backends = urls.len(), "Backends reloaded");
            }
            Err(e) => tracing::error!(error = %e, "Ignoring reloaded backends"),
        }

        match config.rate_limiter.limits() {
            Ok((global, clients)) => self.limiter.reconfigure(global, &clients),
            Err(e) => tracing::error!(error = %e, "Ignoring reloaded rate limits"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    fn config(extra: &str) -> BalancerConfig {
        parse_config(&format!(
            r#"
            [balancer]
            backends = ["http://127.0.0.1:3001", "http://127.0.0.1:3002"]
            {extra}
            "#
        ))
        .unwrap()
    }

    #[test]
    fn new_rejects_invalid_config() {
        let mut config = config("");
        config.balancer.backends.clear();
        assert!(matches!(
            HttpServer::new(config),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn new_installs_configured_limits() {
        let server = HttpServer::new(config(
            r#"
            [rate_limiter]
            enabled = true
            rate = 50
            period = "1s"
            [rate_limiter.clients.alpha]
            rate = 5
            period = "1m"
            "#,
        ))
        .unwrap();

        assert_eq!(server.limiter().get_limit(GLOBAL_KEY).unwrap().rate(), 50);
        assert_eq!(server.limiter().get_limit("alpha").unwrap().rate(), 5);
        assert_eq!(server.balancer().backends().len(), 2);
    }

    #[test]
    fn reload_swaps_backends_and_keeps_strategy() {
        let server = HttpServer::new(config("")).unwrap();
        let reloader = Reloader {
            balancer: server.balancer().clone(),
            limiter: server.limiter().clone(),
            strategy: server.strategy,
        };
        let kept = server.balancer().backends()[1].clone();

        let mut next = config(
            r#"
            [rate_limiter]
            enabled = true
            rate = 7
            period = "1s"
            "#,
        );
        next.balancer.backends = vec![
            "http://127.0.0.1:3002".to_string(),
            "http://127.0.0.1:3003".to_string(),
        ];
        next.balancer.strategy = "random".to_string();
        reloader.apply(&next);

        let backends = server.balancer().backends();
        assert_eq!(backends.len(), 2);
        assert!(Arc::ptr_eq(&backends[0], &kept));
        assert_eq!(backends[1].address(), "http://127.0.0.1:3003");
        assert_eq!(server.balancer().name(), "round-robin");
        assert_eq!(server.limiter().get_limit(GLOBAL_KEY).unwrap().rate(), 7);
    }
}
