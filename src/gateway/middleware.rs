//! Cross-cutting HTTP concerns (§4.1): request id, sliding-window rate
//! limiting, CORS, and the envelope helpers the route handlers use to turn
//! an `AppResult<T>` into a response. Modeled as `tower`/`axum` middleware
//! layers rather than per-handler checks, per the implementation note in
//! §4.1.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::error::AppError;

use super::state::AppState;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-client sliding window: timestamps older than `now - window` are
/// trimmed on every access rather than expired by a background sweep.
pub struct RateLimiter {
    window: Duration,
    max: u64,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub retry_after_secs: u64,
}

impl RateLimiter {
    pub fn new(window: Duration, max: u64) -> Self {
        Self {
            window,
            max,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Trims the client's window, then admits the request if it stays within
    /// `max`. The timestamp is recorded regardless so a burst above the cap
    /// still decays back to zero exactly `window` after its last admitted
    /// request, per §8.
    pub async fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(key.to_string()).or_default();
        while let Some(&front) = bucket.front() {
            if now.duration_since(front) > self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }
        let count = bucket.len() as u64;
        if count >= self.max {
            let retry_after = bucket
                .front()
                .map(|&t| self.window.saturating_sub(now.duration_since(t)))
                .unwrap_or(self.window);
            return RateLimitDecision {
                allowed: false,
                limit: self.max,
                remaining: 0,
                retry_after_secs: retry_after.as_secs().max(1),
            };
        }
        bucket.push_back(now);
        RateLimitDecision {
            allowed: true,
            limit: self.max,
            remaining: self.max - (count + 1),
            retry_after_secs: 0,
        }
    }
}

/// Assigns a request id (echoing an inbound header, else generating a
/// fresh uuid) and stamps it on the response too, so clients and server
/// logs can always correlate on the same value.
pub async fn request_id_mw(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Only applied to `/mcp/*`, per §4.1.4. Keys on the connecting socket's IP;
/// a reverse proxy terminating TLS in front of this process is out of scope.
pub async fn rate_limit_mw(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let key = addr.ip().to_string();
    let decision = state.rate_limiter.check(&key).await;

    if !decision.allowed {
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .map(|r| r.0.clone())
            .unwrap_or_default();
        let err = AppError::RateLimited {
            retry_after_secs: decision.retry_after_secs,
        };
        return error_response(&err, &request_id, state.config.production);
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", decision.limit.into());
    headers.insert("x-ratelimit-remaining", decision.remaining.into());
    response
}

/// Exact-match CORS allowlist only; no wildcard fallback, per §4.1.3.
pub fn cors_layer(allowed_origins: &HashSet<String>) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

/// `{success:true, result}` envelope.
pub fn success_response(result: Value) -> Response {
    Json(serde_json::json!({"success": true, "result": result})).into_response()
}

/// `{success:false, error:{...}}` envelope, with `Retry-After` set when the
/// error kind carries one.
pub fn error_response(err: &AppError, request_id: &str, production: bool) -> Response {
    let status = err.status_code();
    let body = err.to_envelope(request_id, production);
    let mut response = (status, Json(body)).into_response();
    if let Some(secs) = err.retry_after() {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert("retry-after", value);
        }
    }
    response
}

/// Fallback handler for unknown routes: 404 with the standard envelope.
pub async fn not_found(req: Request<Body>) -> Response {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();
    error_response(&AppError::NotFound("route not found".to_string()), &request_id, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_cap_then_rejects() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3);
        for _ in 0..3 {
            assert!(limiter.check("client-a").await.allowed);
        }
        let decision = limiter.check("client-a").await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn separate_clients_have_separate_windows() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        assert!(limiter.check("a").await.allowed);
        assert!(limiter.check("b").await.allowed);
        assert!(!limiter.check("a").await.allowed);
    }

    #[tokio::test]
    async fn window_decays_after_elapsed_time() {
        let limiter = RateLimiter::new(Duration::from_millis(20), 1);
        assert!(limiter.check("a").await.allowed);
        assert!(!limiter.check("a").await.allowed);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.check("a").await.allowed);
    }
}
