//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every backend, all probes in parallel
//! - Update backend liveness based on results
//!
//! A slow probe never delays the next tick or the other backends: the loop
//! only waits on the ticker and the shutdown signal, probes run as separate
//! tasks and are reaped as they finish.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};

use crate::config::HealthCheckConfig;
use crate::load_balancer::{Backend, BackendRegistry};
use crate::observability::metrics;

type HttpClient = Client<HttpConnector, Body>;

/// Why a probe counted as a failure.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid probe request: {0}")]
    Request(#[from] axum::http::Error),
    #[error("connection error: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("non-success status {0}")]
    Status(StatusCode),
}

pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    config: HealthCheckConfig,
    client: HttpClient,
}

impl HealthMonitor {
    pub fn new(registry: Arc<BackendRegistry>, config: HealthCheckConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Self {
            registry,
            config,
            client,
        }
    }

    /// Spawn the loop. Await the handle to block until the loop and every
    /// probe it started have finished.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Active health checks disabled");
            return;
        }

        tracing::info!(
            interval = ?self.config.interval,
            path = %self.config.path,
            "Health monitor starting"
        );

        let mut ticker = time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::debug!("Checking backends");
                    self.check_all(&mut in_flight);
                }
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Health probe task failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }

        let pending = in_flight.len();
        if pending > 0 {
            tracing::debug!(pending, "Waiting for in-flight health probes");
        }
        while in_flight.join_next().await.is_some() {}
    }

    /// Start one probe per backend without waiting for any of them.
    fn check_all(&self, in_flight: &mut JoinSet<()>) {
        for backend in self.registry.list().iter() {
            let backend = backend.clone();
            let registry = self.registry.clone();
            let client = self.client.clone();
            let uri = format!("{}{}", backend.address(), self.config.path);
            let timeout = self.config.timeout;

            in_flight.spawn(async move {
                match probe(&client, &uri, timeout).await {
                    Ok(()) => registry.mark_up(&backend),
                    Err(e) => {
                        tracing::warn!(backend = %backend.address(), error = %e, "Health check failed");
                        registry.mark_down(&backend);
                    }
                }
                report(&backend);
            });
        }
    }
}

fn report(backend: &Backend) {
    metrics::record_backend_health(backend.address(), backend.is_alive());
}

/// GET `uri`; any 2xx within `timeout` is healthy. The body is ignored.
pub async fn probe(client: &HttpClient, uri: &str, timeout: Duration) -> Result<(), ProbeError> {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .header(header::USER_AGENT, "balancer-health-check")
        .body(Body::empty())?;

    let response = time::timeout(timeout, client.request(request))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(ProbeError::Status(status))
    }
}
