//! The single conduit through which the gateway talks to the upstream AI
//! provider: retries with jittered exponential backoff, a circuit breaker,
//! a read-through response cache, and credential injection (§4.4).

pub mod auth;
pub mod cache;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::warn;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::Config;
use crate::error::{AppError, AppResult};

pub use auth::AuthProvider;
use cache::ResponseCache;

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub call_timeout: Duration,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub circuit_failure_threshold: u32,
    pub circuit_open_for: Duration,
}

impl UpstreamConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            base_url: cfg.upstream_base_url.clone(),
            max_attempts: 3,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            cache_capacity: cfg.cache_capacity,
            cache_ttl: Duration::from_secs(cfg.cache_ttl_secs),
            circuit_failure_threshold: cfg.circuit_breaker_failure_threshold,
            circuit_open_for: Duration::from_secs(cfg.circuit_breaker_open_secs),
        }
    }
}

/// A single HTTPS call description, used to build the cache key and to
/// decide whether a 2xx result is cacheable.
struct Call<'a> {
    method: Method,
    path: &'a str,
    params_key: String,
}

/// The shared upstream conduit. Cheaply cloneable: every field is an `Arc`
/// or already `Clone`.
#[derive(Clone)]
pub struct UpstreamClient {
    http: Client,
    auth: Arc<AuthProvider>,
    breaker: CircuitBreaker,
    cache: Arc<ResponseCache>,
    config: Arc<UpstreamConfig>,
    jitter_nonce: Arc<AtomicU64>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig, auth: Arc<AuthProvider>) -> Result<Self, anyhow::Error> {
        let http = Client::builder()
            .timeout(config.call_timeout)
            .build()?;
        let breaker = CircuitBreaker::new(
            "upstream",
            CircuitBreakerConfig {
                failure_threshold: config.circuit_failure_threshold,
                success_threshold: 1,
                timeout: config.circuit_open_for,
            },
        );
        let cache = Arc::new(ResponseCache::new(config.cache_capacity, config.cache_ttl));
        Ok(Self {
            http,
            auth,
            breaker,
            cache,
            config: Arc::new(config),
            jitter_nonce: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// GET with read-through caching.
    pub async fn get(&self, path: &str, params: &Value) -> AppResult<Value> {
        let call = Call {
            method: Method::GET,
            path,
            params_key: stable_params_key(params),
        };
        let key = cache::cache_key("GET", call.path, &call.params_key);
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }
        let result = self.execute(&call, None).await?;
        self.cache.put(key, result.clone()).await;
        Ok(result)
    }

    /// POST/PATCH/DELETE-style calls never read from cache; 2xx responses
    /// still invalidate any cached entry whose key contains `invalidate_key`
    /// (e.g. the session id a mutation targets).
    pub async fn mutate(
        &self,
        method: Method,
        path: &str,
        body: &Value,
        invalidate_key: Option<&str>,
    ) -> AppResult<Value> {
        let call = Call {
            method,
            path,
            params_key: stable_params_key(body),
        };
        let result = self.execute(&call, Some(body)).await?;
        if let Some(k) = invalidate_key {
            self.cache.invalidate_containing(k).await;
        }
        Ok(result)
    }

    async fn execute(&self, call: &Call<'_>, body: Option<&Value>) -> AppResult<Value> {
        if !self.breaker.is_allowed().await {
            let retry_after = self.breaker.retry_after_secs().await;
            return Err(AppError::CircuitOpen {
                breaker: "upstream".to_string(),
                retry_after_secs: retry_after,
            });
        }

        let mut last_err: Option<AppError> = None;
        for attempt in 1..=self.config.max_attempts {
            match self.attempt_once(call, body).await {
                Ok(value) => {
                    self.breaker.record_success().await;
                    return Ok(value);
                }
                Err(err) if is_retryable(&err) => {
                    self.breaker.record_failure().await;
                    last_err = Some(err);
                    if attempt < self.config.max_attempts {
                        let delay = self.backoff_delay(attempt);
                        warn!(attempt, path = call.path, "upstream call failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => {
                    // Permanent 4xx: never retried, never counted against the breaker.
                    return Err(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| AppError::UpstreamTransient("retries exhausted".into())))
    }

    async fn attempt_once(&self, call: &Call<'_>, body: Option<&Value>) -> AppResult<Value> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), call.path);
        let auth_value = self
            .auth
            .header_value()
            .await
            .map_err(|e| AppError::Unauthorized(e.to_string()))?;

        let mut req = self.http.request(call.method.clone(), &url);
        req = if self.auth.is_oauth() {
            req.bearer_auth(auth_value)
        } else {
            req.header("X-Api-Key", auth_value)
        };
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = tokio::time::timeout(self.config.call_timeout, req.send())
            .await
            .map_err(|_| AppError::UpstreamTransient("upstream call timed out".to_string()))?
            .map_err(|e| AppError::UpstreamTransient(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<Value>()
                .await
                .map_err(|e| AppError::UpstreamTransient(format!("invalid upstream JSON: {e}")));
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(AppError::UpstreamTransient(format!(
                "upstream returned {status}"
            )));
        }
        // Any other 4xx is permanent.
        let message = resp
            .text()
            .await
            .unwrap_or_else(|_| status.canonical_reason().unwrap_or("upstream error").to_string());
        Err(AppError::UpstreamPermanent {
            status: status.as_u16(),
            message,
        })
    }

    /// `min(base*2^(n-1) + jitter, cap)`, jitter uniform in `[0, 1)` seconds.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
        let base = self.config.retry_base.saturating_mul(exp as u32);
        let nonce = self.jitter_nonce.fetch_add(1, Ordering::Relaxed);
        let jitter_ms = pseudo_rand_unit(attempt, nonce) * 1000.0;
        let candidate = base + Duration::from_millis(jitter_ms as u64);
        candidate.min(self.config.retry_cap)
    }
}

fn is_retryable(err: &AppError) -> bool {
    matches!(err, AppError::UpstreamTransient(_))
}

/// Serializes a JSON value with sorted object keys so the resulting string
/// is a stable cache/backoff-jitter key regardless of field insertion order.
pub fn stable_params_key(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: Vec<(String, Value)> =
                    map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Deterministic pseudo-random float in `[0, 1)`, matching the teacher's
/// dependency-free LCG idiom (no `rand` crate anywhere in the retrieval pack).
fn pseudo_rand_unit(attempt: u32, nonce: u64) -> f64 {
    const A: u64 = 1_664_525;
    const C: u64 = 1_013_904_223;
    const M: u64 = 1u64 << 32;
    let seed = (attempt as u64).wrapping_mul(2_654_435_761).wrapping_add(nonce);
    let state = A.wrapping_mul(seed).wrapping_add(C) % M;
    state as f64 / M as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_params_key_ignores_field_order() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(stable_params_key(&a), stable_params_key(&b));
    }

    #[test]
    fn jitter_is_within_unit_range() {
        for attempt in 1..10 {
            for nonce in 0..10 {
                let v = pseudo_rand_unit(attempt, nonce);
                assert!((0.0..1.0).contains(&v));
            }
        }
    }

    #[test]
    fn backoff_delay_respects_cap() {
        let client = UpstreamClient::new(
            UpstreamConfig {
                base_url: "https://example.test".to_string(),
                max_attempts: 5,
                retry_base: Duration::from_secs(1),
                retry_cap: Duration::from_secs(10),
                call_timeout: Duration::from_secs(30),
                cache_capacity: 10,
                cache_ttl: Duration::from_secs(10),
                circuit_failure_threshold: 5,
                circuit_open_for: Duration::from_secs(60),
            },
            Arc::new(
                AuthProvider::from_secrets(
                    &crate::config::Secrets {
                        upstream_api_key: Some("k".to_string()),
                        upstream_service_account_path: None,
                        webhook_secret: None,
                    },
                    Client::new(),
                )
                .unwrap(),
            ),
        )
        .unwrap();
        for attempt in 1..6 {
            assert!(client.backoff_delay(attempt) <= Duration::from_secs(10));
        }
    }
}
