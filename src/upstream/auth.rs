//! Credential selection for the upstream client (§4.4).
//!
//! Two schemes are supported: a shared API key header, and an OAuth bearer
//! token minted from a service-account credential. When both are configured,
//! OAuth wins. The bearer token is cached and refreshed once it expires.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::Secrets;

#[derive(Debug, Deserialize)]
struct ServiceAccountFile {
    client_id: String,
    client_secret: String,
    token_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

enum Scheme {
    ApiKey(String),
    OAuth {
        account: ServiceAccountFile,
        cached: RwLock<Option<CachedToken>>,
    },
}

/// Resolves the `Authorization`-equivalent header for every upstream call.
pub struct AuthProvider {
    scheme: Scheme,
    http: Client,
}

impl AuthProvider {
    pub fn from_secrets(secrets: &Secrets, http: Client) -> Result<Self> {
        if let Some(path) = &secrets.upstream_service_account_path {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading service account file {}", path.display()))?;
            let account: ServiceAccountFile = serde_json::from_str(&contents)
                .context("parsing service account JSON")?;
            return Ok(Self {
                scheme: Scheme::OAuth {
                    account,
                    cached: RwLock::new(None),
                },
                http,
            });
        }
        if let Some(key) = &secrets.upstream_api_key {
            return Ok(Self {
                scheme: Scheme::ApiKey(key.clone()),
                http,
            });
        }
        anyhow::bail!("no upstream credential configured: set an API key or a service account path")
    }

    /// Returns the value to set on the upstream request's auth header.
    /// Callers set `Authorization: Bearer <value>` for OAuth, or the
    /// provider's documented API-key header for the shared-key scheme.
    pub async fn header_value(&self) -> Result<String> {
        match &self.scheme {
            Scheme::ApiKey(key) => Ok(key.clone()),
            Scheme::OAuth { account, cached } => self.oauth_token(account, cached).await,
        }
    }

    pub fn is_oauth(&self) -> bool {
        matches!(self.scheme, Scheme::OAuth { .. })
    }

    async fn oauth_token(
        &self,
        account: &ServiceAccountFile,
        cached: &RwLock<Option<CachedToken>>,
    ) -> Result<String> {
        {
            let guard = cached.read().await;
            if let Some(t) = guard.as_ref() {
                if t.expires_at > Instant::now() {
                    return Ok(t.token.clone());
                }
            }
        }

        let mut guard = cached.write().await;
        if let Some(t) = guard.as_ref() {
            if t.expires_at > Instant::now() {
                return Ok(t.token.clone());
            }
        }

        let resp: TokenResponse = self
            .http
            .post(&account.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", account.client_id.as_str()),
                ("client_secret", account.client_secret.as_str()),
            ])
            .send()
            .await
            .context("requesting OAuth token")?
            .error_for_status()
            .context("OAuth token endpoint returned an error status")?
            .json()
            .await
            .context("parsing OAuth token response")?;

        let token = resp.access_token.clone();
        *guard = Some(CachedToken {
            token: token.clone(),
            // Refresh a little early to avoid racing the real expiry.
            expires_at: Instant::now() + Duration::from_secs(resp.expires_in.saturating_sub(30).max(1)),
        });
        Ok(token)
    }
}

pub type SharedAuthProvider = Arc<AuthProvider>;
