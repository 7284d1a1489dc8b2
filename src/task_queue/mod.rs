//! The Task Queue, external ingest (§4.12): accepts tasks derived from
//! external triggers (e.g. an issue tagged with a label) and materializes
//! each into exactly one session via the Session Manager. Failures are
//! retried with backoff; exhausted tasks are marked `failed` and remain
//! visible via `list`/`stats`.
//!
//! Grounded on the teacher's `events/dead_letter.rs` retry-with-backoff
//! idiom (`retry_count`/`status` columns, a periodic sweep marking entries
//! permanently failed once a cap is reached) adapted from at-most-3-retries
//! on a 5-minute fixed interval to the spec's per-task exponential backoff.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::persistence::{IngestTaskRecord, Persistence};
use crate::session::{Session, SessionConfig, SessionManager};

const DEFAULT_MAX_RETRIES: i64 = 3;
const RETRY_BASE_SECS: i64 = 30;
const RETRY_CAP_SECS: i64 = 15 * 60;

#[derive(Debug, Clone, Serialize)]
pub struct IngestTask {
    pub id: String,
    #[serde(rename = "sourceRef")]
    pub source_ref: String,
    pub config: Value,
    pub status: String,
    #[serde(rename = "retryCount")]
    pub retry_count: i64,
    #[serde(rename = "maxRetries")]
    pub max_retries: i64,
    #[serde(rename = "nextAttemptAt")]
    pub next_attempt_at: String,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

impl From<IngestTaskRecord> for IngestTask {
    fn from(r: IngestTaskRecord) -> Self {
        Self {
            id: r.id,
            source_ref: r.source_ref,
            config: r.config,
            status: r.status,
            retry_count: r.retry_count,
            max_retries: r.max_retries,
            next_attempt_at: r.next_attempt_at,
            session_id: r.session_id,
            error: r.error,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestStats {
    pub depth: usize,
    pub counts: HashMap<String, usize>,
}

/// Owns the external-ingest task backlog. Cheaply cloneable.
#[derive(Clone)]
pub struct TaskQueueManager {
    persistence: Persistence,
}

impl TaskQueueManager {
    pub fn new(persistence: Persistence) -> Self {
        Self { persistence }
    }

    /// Accepts one externally-triggered task. `source_ref` names the
    /// triggering entity (e.g. `owner/repo#123`); `config` is the session
    /// config to materialize once the task is processed.
    pub async fn submit(&self, source_ref: String, config: Value) -> AppResult<IngestTask> {
        let now = Utc::now();
        let record = IngestTaskRecord {
            id: Uuid::new_v4().to_string(),
            source_ref,
            config,
            status: "pending".to_string(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            next_attempt_at: now.to_rfc3339(),
            session_id: None,
            error: None,
            created_at: now.to_rfc3339(),
            updated_at: now.to_rfc3339(),
        };
        self.persistence.insert_ingest_task(&record).await.map_err(AppError::Internal)?;
        Ok(record.into())
    }

    pub async fn list(&self) -> AppResult<Vec<IngestTask>> {
        Ok(self
            .persistence
            .list_ingest_tasks()
            .await
            .map_err(AppError::Internal)?
            .into_iter()
            .map(IngestTask::from)
            .collect())
    }

    pub async fn stats(&self) -> AppResult<IngestStats> {
        let tasks = self.persistence.list_ingest_tasks().await.map_err(AppError::Internal)?;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for task in &tasks {
            *counts.entry(task.status.clone()).or_insert(0) += 1;
        }
        let depth = counts.get("pending").copied().unwrap_or(0);
        Ok(IngestStats { depth, counts })
    }

    /// One sweep over due tasks: every `pending` task whose `next_attempt_at`
    /// has passed is attempted exactly once. Success materializes a session
    /// and marks the task `completed`; failure either reschedules with
    /// backoff or, once retries are exhausted, marks it `failed`.
    pub async fn tick(&self, sessions: &SessionManager) -> AppResult<usize> {
        let tasks = self.persistence.list_ingest_tasks().await.map_err(AppError::Internal)?;
        let now = Utc::now();
        let mut attempted = 0usize;

        for mut task in tasks {
            if task.status != "pending" {
                continue;
            }
            let due: DateTime<Utc> = match task.next_attempt_at.parse() {
                Ok(t) => t,
                Err(_) => now,
            };
            if due > now {
                continue;
            }
            attempted += 1;

            let config: SessionConfig = match serde_json::from_value(task.config.clone()) {
                Ok(c) => c,
                Err(e) => {
                    task.status = "failed".to_string();
                    task.error = Some(format!("invalid ingest task config: {e}"));
                    self.persistence.update_ingest_task(&task).await.map_err(AppError::Internal)?;
                    warn!(task_id = %task.id, source_ref = %task.source_ref, "ingest task has invalid config, marking failed");
                    continue;
                }
            };

            match sessions.create(config).await {
                Ok(Session { id, .. }) => {
                    task.status = "completed".to_string();
                    task.session_id = Some(id.clone());
                    task.error = None;
                    self.persistence.update_ingest_task(&task).await.map_err(AppError::Internal)?;
                    info!(task_id = %task.id, session_id = %id, "ingest task materialized into session");
                }
                Err(err) => {
                    task.retry_count += 1;
                    task.error = Some(err.to_string());
                    if task.retry_count >= task.max_retries {
                        task.status = "failed".to_string();
                        warn!(task_id = %task.id, retries = task.retry_count, "ingest task exhausted retries, marking failed");
                    } else {
                        task.next_attempt_at = (now + chrono::Duration::seconds(backoff_secs(task.retry_count))).to_rfc3339();
                        warn!(task_id = %task.id, retry = task.retry_count, next_attempt_at = %task.next_attempt_at, "ingest task attempt failed, rescheduling");
                    }
                    self.persistence.update_ingest_task(&task).await.map_err(AppError::Internal)?;
                }
            }
        }

        Ok(attempted)
    }
}

fn backoff_secs(retry_count: i64) -> i64 {
    let shift = (retry_count - 1).max(0).min(10) as u32;
    (RETRY_BASE_SECS * 2i64.pow(shift)).min(RETRY_CAP_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secrets;
    use crate::notify::NotificationBus;
    use crate::upstream::{AuthProvider, UpstreamClient, UpstreamConfig};
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    async fn manager() -> (TaskQueueManager, SessionManager) {
        let persistence = Persistence::connect(None, Path::new("/tmp/unused")).await.unwrap();
        let secrets = Secrets {
            upstream_api_key: Some("test-key".to_string()),
            upstream_service_account_path: None,
            webhook_secret: None,
        };
        let auth = AuthProvider::from_secrets(&secrets, reqwest::Client::new()).unwrap();
        let upstream = UpstreamClient::new(
            UpstreamConfig {
                base_url: "http://127.0.0.1:0".to_string(),
                max_attempts: 1,
                retry_base: Duration::from_millis(1),
                retry_cap: Duration::from_millis(5),
                call_timeout: Duration::from_millis(50),
                cache_capacity: 10,
                cache_ttl: Duration::from_secs(5),
                circuit_failure_threshold: 5,
                circuit_open_for: Duration::from_secs(60),
            },
            Arc::new(auth),
        )
        .unwrap();
        let bus = NotificationBus::new();
        let sessions = SessionManager::new(persistence.clone(), upstream, bus);
        (TaskQueueManager::new(persistence), sessions)
    }

    #[tokio::test]
    async fn submit_records_pending_task() {
        let (tq, _sessions) = manager().await;
        let task = tq
            .submit("acme/widgets#42".to_string(), json!({"prompt": "0123456789", "source": "sources/gh/acme/widgets"}))
            .await
            .unwrap();
        assert_eq!(task.status, "pending");
        assert_eq!(task.retry_count, 0);
        let stats = tq.stats().await.unwrap();
        assert_eq!(stats.depth, 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_secs(1), 30);
        assert_eq!(backoff_secs(2), 60);
        assert_eq!(backoff_secs(3), 120);
        assert_eq!(backoff_secs(20), RETRY_CAP_SECS);
    }
}
