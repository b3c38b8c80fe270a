//! Keyed token-bucket rate limiting with a global pool.
//!
//! One reserved `global` bucket bounds aggregate traffic. Clients with an
//! explicit limit additionally get their own bucket. Clients without one are
//! bounded only by the global pool.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::http::response::json_message;
use crate::observability::metrics;
use crate::security::client_settings::ClientSettings;
use crate::security::token_bucket::{Limit, TokenBucket};

/// Reserved key of the aggregate bucket.
pub const GLOBAL_KEY: &str = "global";

/// Header carrying an explicit client identifier.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

#[derive(Debug, Default)]
struct LimiterState {
    global: Option<TokenBucket>,
    clients: HashMap<String, TokenBucket>,
    settings: ClientSettings,
    /// Client limits from the last configuration file applied.
    file_limits: HashMap<String, Limit>,
    /// Clients whose override was last written through the admin API.
    runtime: HashSet<String>,
}

impl LimiterState {
    fn install(&mut self, key: &str, limit: Limit, now: Instant) {
        let bucket = TokenBucket::new(limit, now);
        if key == GLOBAL_KEY {
            self.global = Some(bucket);
        } else {
            self.clients.insert(key.to_string(), bucket);
        }
    }

    /// Bring a client's bucket in line with its override. A bucket already
    /// enforcing the override keeps its tokens.
    fn rebuild(&mut self, client_id: &str, now: Instant) {
        match self.settings.get(client_id) {
            Some(limit) => {
                if self.clients.get(client_id).map(TokenBucket::limit) != Some(limit) {
                    self.install(client_id, limit, now);
                }
            }
            None => {
                self.clients.remove(client_id);
            }
        }
    }
}

/// In-memory rate limiter.
///
/// A single mutex covers the bucket map and every bucket; admission is O(1)
/// with no I/O under the lock, so admission for one key is linearizable.
#[derive(Debug, Default)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
    refill_interval: Option<Duration>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A limiter refilled by a background loop every `interval`. Limits that
    /// would gain less than one token per tick are logged as they are
    /// installed.
    pub fn with_refill_interval(interval: Duration) -> Self {
        Self {
            state: Mutex::default(),
            refill_interval: Some(interval),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_refill(&self, key: &str, limit: Limit) {
        let Some(interval) = self.refill_interval else {
            return;
        };
        if limit.stalls_at(interval) {
            tracing::warn!(
                key = %key,
                rate = limit.rate(),
                period = ?limit.period(),
                refill_interval = ?interval,
                "Refill interval is shorter than one token's worth of time; a drained bucket will not recover"
            );
        }
    }

    /// Admission check for one request from `client_id`.
    ///
    /// The global bucket is debited exactly once per admitted request and
    /// never for a rejected one.
    pub fn allow(&self, client_id: &str) -> bool {
        let mut state = self.lock();
        let now = Instant::now();
        let LimiterState {
            global, clients, ..
        } = &mut *state;

        if let Some(global) = global.as_mut() {
            global.refill(now);
            if global.tokens() == 0 {
                return false;
            }
        }

        if let Some(bucket) = clients.get_mut(client_id) {
            bucket.refill(now);
            if !bucket.try_take() {
                return false;
            }
        }

        if let Some(global) = global.as_mut() {
            global.try_take();
        }
        true
    }

    /// Create or replace the bucket for `key` with a full bucket.
    pub fn set_limit(&self, key: &str, limit: Limit) {
        self.check_refill(key, limit);
        let mut state = self.lock();
        state.install(key, limit, Instant::now());
        tracing::debug!(key = %key, rate = limit.rate(), period = ?limit.period(), "Rate limit set");
    }

    /// `set_limit` plus a persisted override that survives bucket rebuilds
    /// and configuration reloads.
    pub fn set_client_limit(&self, client_id: &str, limit: Limit) {
        self.check_refill(client_id, limit);
        let mut state = self.lock();
        state.settings.set(client_id, limit);
        state.runtime.insert(client_id.to_string());
        state.install(client_id, limit, Instant::now());
        tracing::debug!(client = %client_id, rate = limit.rate(), period = ?limit.period(), "Client limit set");
    }

    /// Drop the client's override and bucket. The client is then governed by
    /// the global bucket alone. Removing [`GLOBAL_KEY`] lifts the global limit.
    pub fn remove_client_limit(&self, client_id: &str) {
        let mut state = self.lock();
        if client_id == GLOBAL_KEY {
            state.global = None;
        } else {
            state.settings.remove(client_id);
            state.runtime.remove(client_id);
            state.clients.remove(client_id);
        }
        tracing::debug!(key = %client_id, "Rate limit removed");
    }

    /// Limit currently enforced for `key`, if it has a bucket.
    pub fn get_limit(&self, key: &str) -> Option<Limit> {
        let state = self.lock();
        if key == GLOBAL_KEY {
            state.global.as_ref().map(TokenBucket::limit)
        } else {
            state.clients.get(key).map(TokenBucket::limit)
        }
    }

    /// Tokens left in the bucket for `key`, as of the last refill.
    pub fn tokens(&self, key: &str) -> Option<u32> {
        let state = self.lock();
        if key == GLOBAL_KEY {
            state.global.as_ref().map(TokenBucket::tokens)
        } else {
            state.clients.get(key).map(TokenBucket::tokens)
        }
    }

    /// Refill every bucket from elapsed time.
    pub fn refill_all(&self) {
        let mut state = self.lock();
        let now = Instant::now();
        let LimiterState {
            global, clients, ..
        } = &mut *state;

        if let Some(global) = global.as_mut() {
            global.refill(now);
        }
        for bucket in clients.values_mut() {
            bucket.refill(now);
        }
        tracing::trace!(buckets = clients.len(), "Refilled rate limit buckets");
    }

    /// Apply limits loaded from configuration.
    ///
    /// Only file entries that are new or changed since the previous file are
    /// applied, so an override set through [`RateLimiter::set_client_limit`]
    /// survives reloads until the file changes that client's entry. Entries
    /// dropped from the file are removed unless overridden at runtime.
    /// Buckets whose limit is unchanged keep their tokens.
    pub fn reconfigure(&self, global: Option<Limit>, clients: &[(String, Limit)]) {
        if let Some(limit) = global {
            self.check_refill(GLOBAL_KEY, limit);
        }
        let wanted: HashMap<String, Limit> = clients.iter().cloned().collect();

        let mut state = self.lock();
        let now = Instant::now();

        if state.global.as_ref().map(TokenBucket::limit) != global {
            state.global = global.map(|limit| TokenBucket::new(limit, now));
        }

        let previous = std::mem::take(&mut state.file_limits);
        let mut touched = Vec::new();
        for id in previous.keys() {
            if !wanted.contains_key(id) && !state.runtime.contains(id) {
                state.settings.remove(id);
                touched.push(id.clone());
            }
        }
        for (id, limit) in &wanted {
            if previous.get(id) != Some(limit) {
                self.check_refill(id, *limit);
                state.settings.set(id, *limit);
                state.runtime.remove(id);
                touched.push(id.clone());
            }
        }
        for id in &touched {
            state.rebuild(id, now);
        }
        state.file_limits = wanted;

        tracing::info!(
            global = global.is_some(),
            clients = state.clients.len(),
            changed = touched.len(),
            "Rate limiter reconfigured"
        );
    }
}

/// Resolve the identifier a request is rate limited under: the
/// `X-Client-ID` header, else the forwarded client IP, else the peer IP.
pub fn client_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(id) = header(CLIENT_ID_HEADER) {
        return id.to_string();
    }
    if let Some(forwarded) = header("x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next().map(str::trim) {
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = header("x-real-ip") {
        return real_ip.to_string();
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware function for rate limiting.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_identifier(request.headers(), peer);

    if limiter.allow(&client) {
        next.run(request).await
    } else {
        tracing::warn!(client = %client, "Rate limit exceeded");
        metrics::record_rate_limited();
        json_message(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests")
    }
}
