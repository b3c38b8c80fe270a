//! Request forwarding.
//!
//! # Responsibilities
//! - Ask the strategy for a backend, fail fast with 503 when there is none
//! - Hold the backend's connection count for the whole exchange, body included
//! - Demote the backend on transport failure, never on an upstream status
//!   and never when the client's own request body fails
//!
//! # Design Decisions
//! - No retries: failover across backends is the caller's decision
//! - Dropping the future (client went away) drops the upstream call and the
//!   connection guard with it

use std::error::Error as StdError;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
};
use hyper::body::{Body as HttpBody, Bytes, Frame, Incoming, SizeHint};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use crate::http::response::json_message;
use crate::load_balancer::{BackendConnectionGuard, LoadBalancer};
use crate::observability::metrics;

type HttpClient = Client<HttpConnector, Body>;

/// Headers that describe one hop and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Every backend is down. Not a transport error.
    #[error("no backend available")]
    NoBackend,
    /// The backend could not be reached; it has been marked down.
    #[error("backend {backend} request failed: {source}")]
    Upstream {
        backend: String,
        #[source]
        source: hyper_util::client::legacy::Error,
    },
    /// Reading the inbound request body failed while it was being sent, so
    /// the backend is left alone.
    #[error("request body failed while forwarding to {backend}: {source}")]
    RequestBody {
        backend: String,
        #[source]
        source: hyper_util::client::legacy::Error,
    },
    #[error("failed to build upstream request: {0}")]
    Request(#[from] axum::http::Error),
}

impl ForwardError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoBackend => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::RequestBody { .. } => StatusCode::BAD_REQUEST,
            Self::Request(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::NoBackend => "No backend available",
            Self::Upstream { .. } => "Backend request failed",
            Self::RequestBody { .. } => "Invalid request body",
            Self::Request(_) => "Failed to create proxy request",
        };
        json_message(self.status_code(), message)
    }
}

/// Forwards requests to the backend chosen by the active strategy.
#[derive(Debug, Clone)]
pub struct Forwarder {
    balancer: Arc<dyn LoadBalancer>,
    client: HttpClient,
}

impl Forwarder {
    pub fn new(balancer: Arc<dyn LoadBalancer>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { balancer, client }
    }

    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    pub async fn forward(&self, request: Request<Body>) -> Result<Response, ForwardError> {
        let start = Instant::now();
        let method = request.method().clone();

        let Some(backend) = self.balancer.next_server() else {
            tracing::warn!(method = %method, path = %request.uri().path(), "No backend available");
            metrics::record_request(method.as_str(), 503, "none", start);
            return Err(ForwardError::NoBackend);
        };

        let guard = backend.connection_guard();
        let body_failed = Arc::new(AtomicBool::new(false));
        let request = request.map(|body| {
            Body::new(InboundBody {
                inner: body,
                failed: body_failed.clone(),
            })
        });
        let upstream = upstream_request(backend.address(), request)?;

        tracing::debug!(
            method = %method,
            uri = %upstream.uri(),
            backend = %backend.address(),
            active_connections = backend.active_connections(),
            "Proxying request"
        );

        match self.client.request(upstream).await {
            Ok(response) => {
                metrics::record_request(
                    method.as_str(),
                    response.status().as_u16(),
                    backend.address(),
                    start,
                );
                let (parts, body) = response.into_parts();
                let body = GuardedBody {
                    inner: body,
                    _guard: guard,
                };
                Ok(Response::from_parts(parts, Body::new(body)))
            }
            Err(source)
                if body_failed.load(Ordering::Acquire) || is_request_body_error(&source) =>
            {
                tracing::warn!(backend = %backend.address(), error = %source, "Request body failed");
                metrics::record_request(method.as_str(), 400, backend.address(), start);
                Err(ForwardError::RequestBody {
                    backend: backend.address().to_string(),
                    source,
                })
            }
            Err(source) => {
                tracing::error!(backend = %backend.address(), error = %source, "Upstream error");
                self.balancer.mark_down(&backend);
                metrics::record_request(method.as_str(), 502, backend.address(), start);
                Err(ForwardError::Upstream {
                    backend: backend.address().to_string(),
                    source,
                })
            }
        }
    }
}

/// Whether a client error was caused by our side of the exchange: the request
/// body stream failed or its write was aborted. Connect and IO failures are
/// the backend's.
fn is_request_body_error(err: &hyper_util::client::legacy::Error) -> bool {
    if err.is_connect() {
        return false;
    }
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(hyper_err) = cause.downcast_ref::<hyper::Error>() {
            return hyper_err.is_user() || hyper_err.is_body_write_aborted();
        }
        source = cause.source();
    }
    false
}

/// Rewrite an inbound request for `address`, keeping method, path, query,
/// end-to-end headers and body.
fn upstream_request(address: &str, request: Request<Body>) -> Result<Request<Body>, axum::http::Error> {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let mut builder = Request::builder()
        .method(parts.method)
        .uri(format!("{address}{path}"));
    if let Some(headers) = builder.headers_mut() {
        *headers = forwarded_headers(parts.headers, peer);
    }
    builder.body(body)
}

fn forwarded_headers(mut headers: HeaderMap, peer: Option<IpAddr>) -> HeaderMap {
    // Headers listed in `Connection` are hop-by-hop too.
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in HOP_BY_HOP.iter().chain(listed.iter()) {
        headers.remove(name);
    }
    // The client sets Host from the upstream URI.
    headers.remove(header::HOST);

    if let Some(ip) = peer {
        let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{prior}, {ip}"),
            None => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    headers
}

/// Request body that records whether the client's stream failed, so the
/// failure is not mistaken for the backend's.
struct InboundBody {
    inner: Body,
    failed: Arc<AtomicBool>,
}

impl HttpBody for InboundBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(Some(Err(_))) = &frame {
            this.failed.store(true, Ordering::Release);
        }
        frame
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Response body that keeps the backend's connection count until the body
/// has been fully sent or dropped.
struct GuardedBody {
    inner: Incoming,
    _guard: BackendConnectionGuard,
}

impl HttpBody for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use crate::load_balancer::{Backend, BackendRegistry};

    /// Picks the first alive backend and counts demotions.
    #[derive(Debug)]
    struct CountingBalancer {
        registry: Arc<BackendRegistry>,
        mark_downs: AtomicUsize,
    }

    impl LoadBalancer for CountingBalancer {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn registry(&self) -> &Arc<BackendRegistry> {
            &self.registry
        }

        fn next_server(&self) -> Option<Arc<Backend>> {
            self.registry.available().into_iter().next()
        }

        fn mark_down(&self, backend: &Backend) {
            self.mark_downs.fetch_add(1, Ordering::SeqCst);
            self.registry.mark_down(backend);
        }
    }

    /// Accepts connections and reads requests without ever answering.
    async fn reading_backend() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {}
                });
            }
        });
        format!("http://{addr}")
    }

    /// Sends one chunk, then fails the way an aborted upload does.
    struct AbortedUpload {
        sent: bool,
    }

    impl HttpBody for AbortedUpload {
        type Data = Bytes;
        type Error = std::io::Error;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            let this = self.get_mut();
            if this.sent {
                return Poll::Ready(Some(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "client went away",
                ))));
            }
            this.sent = true;
            Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(b"partial")))))
        }
    }

    async fn closed_port() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("http://{}", listener.local_addr().unwrap())
    }

    #[tokio::test]
    async fn transport_failure_demotes_once_and_releases_guard() {
        let backend = Arc::new(Backend::new(closed_port().await.parse().unwrap()));
        let balancer = Arc::new(CountingBalancer {
            registry: Arc::new(BackendRegistry::new(vec![backend.clone()])),
            mark_downs: AtomicUsize::new(0),
        });
        let forwarder = Forwarder::new(balancer.clone());

        let request = Request::get("http://proxy.local/").body(Body::empty()).unwrap();
        let err = forwarder.forward(request).await.unwrap_err();
        assert!(matches!(err, ForwardError::Upstream { .. }));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(balancer.mark_downs.load(Ordering::SeqCst), 1);
        assert!(!backend.is_alive());
        assert_eq!(backend.active_connections(), 0);

        let request = Request::get("http://proxy.local/").body(Body::empty()).unwrap();
        let err = forwarder.forward(request).await.unwrap_err();
        assert!(matches!(err, ForwardError::NoBackend));
        assert_eq!(balancer.mark_downs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_request_body_keeps_backend_alive() {
        let backend = Arc::new(Backend::new(reading_backend().await.parse().unwrap()));
        let balancer = Arc::new(CountingBalancer {
            registry: Arc::new(BackendRegistry::new(vec![backend.clone()])),
            mark_downs: AtomicUsize::new(0),
        });
        let forwarder = Forwarder::new(balancer.clone());

        let request = Request::post("http://proxy.local/upload")
            .body(Body::new(AbortedUpload { sent: false }))
            .unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), forwarder.forward(request))
            .await
            .expect("forward should fail once the body fails")
            .unwrap_err();

        assert!(matches!(err, ForwardError::RequestBody { .. }), "got {err}");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(balancer.mark_downs.load(Ordering::SeqCst), 0);
        assert!(backend.is_alive());
        assert_eq!(backend.active_connections(), 0);
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn strips_hop_by_hop_and_host() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "proxy.local".parse().unwrap());
        headers.insert(header::CONNECTION, "keep-alive, x-trace".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("x-trace", "abc".parse().unwrap());
        headers.insert(header::ACCEPT, "text/plain".parse().unwrap());

        let out = forwarded_headers(headers, None);
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get("keep-alive").is_none());
        assert!(out.get("x-trace").is_none());
        assert_eq!(out.get(header::ACCEPT).unwrap(), "text/plain");
    }

    #[test]
    fn appends_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, "1.1.1.1".parse().unwrap());
        let out = forwarded_headers(headers, Some("10.0.0.7".parse().unwrap()));
        assert_eq!(out.get(X_FORWARDED_FOR).unwrap(), "1.1.1.1, 10.0.0.7");

        let out = forwarded_headers(HeaderMap::new(), Some("10.0.0.7".parse().unwrap()));
        assert_eq!(out.get(X_FORWARDED_FOR).unwrap(), "10.0.0.7");
    }

    #[test]
    fn rewrites_uri_onto_backend() {
        let request = Request::builder()
            .method("POST")
            .uri("http://proxy.local/api/items?page=2")
            .body(Body::empty())
            .unwrap();
        let upstream = upstream_request("http://10.0.0.1:3000", request).unwrap();
        assert_eq!(upstream.method(), "POST");
        assert_eq!(upstream.uri(), "http://10.0.0.1:3000/api/items?page=2");
    }

    #[test]
    fn error_status_codes() {
        assert_eq!(ForwardError::NoBackend.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ForwardError::NoBackend.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
