//! The Webhook Receiver (§4.8): a second, asynchronous ingress path that
//! turns deploy-failure notifications into auto-remediation sessions.
//!
//! HMAC verification is grounded on the teacher's `sha2`/`hmac`/`hex` trio
//! (the only other place in the teacher pack carrying an HMAC value is
//! `storage/mod.rs`'s `LicenseCacheRow.hmac` field). Dedup and reaping are
//! grounded on `events/dead_letter.rs`'s periodic-sweep-over-a-table idiom,
//! adapted to the bounded `deploy_remediations` table the persistence layer
//! already exposes.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::persistence::{Persistence, WebhookEventEntry};
use crate::session::{AutomationMode, Session, SessionConfig, SessionManager};
use crate::upstream::UpstreamClient;

type HmacSha256 = Hmac<Sha256>;

const TOP_ERROR_LINES: usize = 10;

#[derive(Debug, Deserialize)]
pub struct DeployFailedPayload {
    pub event: String,
    #[serde(rename = "serviceId")]
    pub service_id: String,
    #[serde(rename = "deployId")]
    pub deploy_id: String,
    #[serde(rename = "buildLogUrl")]
    pub build_log_url: Option<String>,
    pub branch: Option<String>,
    pub source: Option<String>,
}

/// Outcome of handling one webhook delivery, surfaced to the HTTP layer only
/// for logging; the response body is always the generic `{received:true}`
/// envelope regardless of outcome once the signature has verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    RemediationStarted { session_id: String },
    Deduplicated,
    Ignored(&'static str),
}

pub struct WebhookReceiver {
    persistence: Persistence,
    upstream: UpstreamClient,
    sessions: SessionManager,
    secret: Option<String>,
    monitored_services: std::collections::HashSet<String>,
    auto_fix_enabled: bool,
    retention_secs: u64,
}

impl WebhookReceiver {
    pub fn new(persistence: Persistence, upstream: UpstreamClient, sessions: SessionManager, config: &Config) -> Self {
        Self {
            persistence,
            upstream,
            sessions,
            secret: config.secrets.webhook_secret.clone(),
            monitored_services: config.webhook_monitored_services.clone(),
            auto_fix_enabled: config.webhook_auto_fix_enabled,
            retention_secs: config.webhook_remediation_retention_secs,
        }
    }

    /// Verifies the HMAC-SHA256 signature over the raw request body. When no
    /// secret is configured, verification is skipped and a warning logged
    /// (development mode) rather than rejecting every request.
    pub fn verify_signature(&self, raw_body: &[u8], signature_header: Option<&str>) -> AppResult<()> {
        let Some(secret) = &self.secret else {
            warn!("webhook signature verification skipped: no secret configured");
            return Ok(());
        };
        let Some(header) = signature_header else {
            return Err(AppError::Unauthorized("missing webhook signature header".to_string()));
        };
        let expected_hex = header.strip_prefix("sha256=").unwrap_or(header);
        let expected = hex::decode(expected_hex).map_err(|_| AppError::Unauthorized("malformed webhook signature".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(raw_body);
        mac.verify_slice(&expected).map_err(|_| AppError::Unauthorized("webhook signature mismatch".to_string()))
    }

    /// Handles one `deploy_failed`-shaped delivery after signature
    /// verification. Any other event type or unmonitored service is a no-op
    /// that still returns success (the provider shouldn't retry it).
    pub async fn handle(&self, provider: &str, raw_body: &[u8]) -> AppResult<WebhookOutcome> {
        let payload: Value = serde_json::from_slice(raw_body).map_err(|e| AppError::Validation(format!("invalid webhook payload: {e}")))?;

        self.persistence
            .record_webhook_event(&WebhookEventEntry {
                id: Uuid::new_v4().to_string(),
                source: provider.to_string(),
                event_type: payload.get("event").and_then(|v| v.as_str()).unwrap_or("unknown").to_string(),
                payload: payload.clone(),
                processed: false,
                workflow_instance: None,
                created_at: Utc::now().to_rfc3339(),
            })
            .await
            .map_err(AppError::Internal)?;

        let parsed: DeployFailedPayload = match serde_json::from_value(payload) {
            Ok(p) => p,
            Err(_) => return Ok(WebhookOutcome::Ignored("payload does not match deploy_failed shape")),
        };

        if parsed.event != "deploy_failed" {
            return Ok(WebhookOutcome::Ignored("event is not deploy_failed"));
        }
        if !self.auto_fix_enabled {
            return Ok(WebhookOutcome::Ignored("auto-fix disabled"));
        }
        if !self.monitored_services.contains(&parsed.service_id) {
            return Ok(WebhookOutcome::Ignored("service is not monitored"));
        }

        let placeholder = format!("pending:{}", Uuid::new_v4());
        let claimed = self
            .persistence
            .try_claim_remediation(&parsed.service_id, &parsed.deploy_id, &placeholder)
            .await
            .map_err(AppError::Internal)?;
        if !claimed {
            info!(service_id = %parsed.service_id, deploy_id = %parsed.deploy_id, "remediation already in flight, skipping");
            return Ok(WebhookOutcome::Deduplicated);
        }

        let error_summary = self.fetch_error_summary(&parsed).await;
        let prompt = build_remediation_prompt(&parsed.deploy_id, &error_summary);
        let source = parsed.source.clone().unwrap_or_else(|| format!("sources/deploy/{}/service", parsed.service_id));

        let session_config = SessionConfig {
            prompt,
            source,
            branch: parsed.branch.clone(),
            title: Some(format!("Auto-remediation: {} deploy {}", parsed.service_id, parsed.deploy_id)),
            require_plan_approval: true,
            automation_mode: AutomationMode::AutoCreatePr,
        };

        let Session { id: session_id, .. } = self.sessions.create(session_config).await?;
        self.persistence
            .set_remediation_session(&parsed.service_id, &parsed.deploy_id, &session_id)
            .await
            .map_err(AppError::Internal)?;

        info!(service_id = %parsed.service_id, deploy_id = %parsed.deploy_id, session_id = %session_id, "auto-remediation session created");
        Ok(WebhookOutcome::RemediationStarted { session_id })
    }

    /// Best-effort: fetches the build log and extracts the top error lines.
    /// A fetch failure degrades to an empty summary rather than blocking
    /// remediation session creation.
    async fn fetch_error_summary(&self, payload: &DeployFailedPayload) -> String {
        let Some(log_url) = &payload.build_log_url else {
            return String::new();
        };
        match self.upstream.get(log_url, &Value::Null).await {
            Ok(body) => {
                let text = body.get("log").and_then(|v| v.as_str()).unwrap_or_default();
                extract_top_error_lines(text, TOP_ERROR_LINES)
            }
            Err(err) => {
                warn!(deploy_id = %payload.deploy_id, error = %err, "failed to fetch build log for remediation");
                String::new()
            }
        }
    }

    /// Evicts deploy→session mappings older than the configured retention.
    pub async fn reap_expired(&self) -> AppResult<u64> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(self.retention_secs as i64)).to_rfc3339();
        self.persistence.reap_remediations_older_than(&cutoff).await.map_err(AppError::Internal)
    }
}

/// Fixed-pattern extraction: lines containing `error`/`Error`/`FAILED`, first
/// `n` matches in file order.
fn extract_top_error_lines(log: &str, n: usize) -> String {
    log.lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("error") || lower.contains("failed") || lower.contains("panic")
        })
        .take(n)
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_remediation_prompt(deploy_id: &str, error_summary: &str) -> String {
    if error_summary.is_empty() {
        format!(
            "Deploy {deploy_id} failed. No build log was available; investigate the most recent \
             deployment failure and propose a fix."
        )
    } else {
        format!("Deploy {deploy_id} failed with the following errors:\n\n{error_summary}\n\nPropose a fix.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_only_matching_lines_in_order() {
        let log = "building...\nERROR: compile failed\nok\nwarning: unused\nError: linker failed\ndone";
        let summary = extract_top_error_lines(log, 10);
        assert_eq!(summary, "ERROR: compile failed\nError: linker failed");
    }

    #[test]
    fn caps_at_requested_count() {
        let log = (0..20).map(|i| format!("error {i}")).collect::<Vec<_>>().join("\n");
        let summary = extract_top_error_lines(&log, 3);
        assert_eq!(summary.lines().count(), 3);
    }

    #[test]
    fn prompt_mentions_deploy_id_even_without_logs() {
        let prompt = build_remediation_prompt("d-1", "");
        assert!(prompt.contains("d-1"));
    }
}
