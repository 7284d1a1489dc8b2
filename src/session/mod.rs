//! The Session Manager (§4.3): owns the session record and drives its state
//! machine. Session records and activities are durable (persistence layer);
//! live status is kept in sync with the upstream provider lazily, on read,
//! rather than by a push subscription — `get` is the single primitive the
//! monitoring loop in `scheduler_loops` repeatedly calls.
//!
//! Upstream wire contract (our own design choice, the upstream API itself
//! being a black box per scope): `POST /sessions` to create, `GET
//! /sessions/{id}` returns `{phase, plan?, result?, prUrl?}` where `phase` is
//! one of `planning|awaiting_approval|executing|completed|failed`, `POST
//! /sessions/{id}/approve`, `POST /sessions/{id}/messages`, `POST
//! /sessions/{id}/cancel`, `GET /sessions/{id}/diff`, and `GET
//! /sources/{provider}/{owner}/{repo}/default-branch` for branch resolution.

pub mod state;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::notify::{session_event, NotificationBus};
use crate::persistence::{Activity, Persistence, SessionRecord};
use crate::upstream::UpstreamClient;
use crate::validator::{validate_branch, validate_prompt, validate_source, validate_title, IssueList};

pub use state::SessionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutomationMode {
    #[default]
    None,
    AutoCreatePr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub prompt: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, rename = "requirePlanApproval")]
    pub require_plan_approval: bool,
    #[serde(default, rename = "automationMode")]
    pub automation_mode: AutomationMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
}

impl From<Activity> for ActivityEntry {
    fn from(a: Activity) -> Self {
        Self {
            timestamp: a.timestamp,
            kind: a.kind,
            content: a.content,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
    pub config: SessionConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Value>,
    pub activities: Vec<ActivityEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(rename = "prUrl", skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
    #[serde(rename = "durationSincePreviousMs", skip_serializing_if = "Option::is_none")]
    pub duration_since_previous_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub counts: HashMap<String, usize>,
    #[serde(rename = "byState")]
    pub by_state: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListFilter {
    pub state: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchFilter {
    pub query: Option<String>,
    pub state: Option<String>,
    pub limit: Option<usize>,
}

fn source_well_formed(source: &str) -> Option<(&str, &str, &str)> {
    let rest = source.strip_prefix("sources/")?;
    let mut parts = rest.splitn(3, '/');
    let provider = parts.next()?;
    let owner = parts.next()?;
    let repo = parts.next()?;
    Some((provider, owner, repo))
}

/// Owns the session state machine. Cheaply cloneable.
#[derive(Clone)]
pub struct SessionManager {
    persistence: Persistence,
    upstream: UpstreamClient,
    notify: NotificationBus,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SessionManager {
    pub fn new(persistence: Persistence, upstream: UpstreamClient, notify: NotificationBus) -> Self {
        Self {
            persistence,
            upstream,
            notify,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn validate_config(&self, config: &SessionConfig) -> AppResult<()> {
        let mut issues = IssueList::new();
        if let Err(msg) = validate_source(&config.source) {
            issues.push("source", msg);
        }
        if let Err(msg) = validate_prompt(&config.prompt) {
            issues.push("prompt", msg);
        }
        if let Some(branch) = &config.branch {
            if let Err(msg) = validate_branch(branch) {
                issues.push("branch", msg);
            }
        }
        if let Some(title) = &config.title {
            if let Err(msg) = validate_title(title) {
                issues.push("title", msg);
            }
        }
        issues.into_result(())
    }

    async fn resolve_branch(&self, source: &str) -> AppResult<String> {
        let Some((provider, owner, repo)) = source_well_formed(source) else {
            return Ok("main".to_string());
        };
        let path = format!("/sources/{provider}/{owner}/{repo}/default-branch");
        match self.upstream.get(&path, &json!({})).await {
            Ok(value) => Ok(value
                .get("branch")
                .and_then(Value::as_str)
                .unwrap_or("main")
                .to_string()),
            Err(_) => Ok("main".to_string()),
        }
    }

    async fn load(&self, id: &str) -> AppResult<SessionRecord> {
        self.persistence
            .get_session(id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))
    }

    async fn to_session(&self, record: SessionRecord) -> AppResult<Session> {
        let config: SessionConfig =
            serde_json::from_value(record.config.clone()).map_err(|e| AppError::Internal(e.into()))?;
        let activities = self
            .persistence
            .list_activities(&record.id)
            .await
            .map_err(AppError::Internal)?
            .into_iter()
            .map(ActivityEntry::from)
            .collect();
        let status = SessionStatus::parse(&record.status)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("corrupt session status {}", record.status)))?;
        Ok(Session {
            id: record.id,
            status,
            created_at: record.created_at,
            updated_at: record.updated_at,
            config,
            plan: record.plan,
            activities,
            result: record.result,
            pr_url: record.pr_url,
        })
    }

    async fn append_activity(&self, id: &str, kind: &str, content: Value) -> AppResult<()> {
        let activity = Activity {
            timestamp: Utc::now().to_rfc3339(),
            kind: kind.to_string(),
            content,
        };
        self.persistence.append_activity(id, &activity).await.map_err(AppError::Internal)
    }

    /// Applies `to` if permitted by the state machine; persists and notifies.
    /// Returns `false` (without error) if the edge is not currently legal —
    /// callers driving off upstream polling treat that as "not yet".
    async fn transition(&self, record: &mut SessionRecord, to: SessionStatus) -> AppResult<bool> {
        let from = SessionStatus::parse(&record.status)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("corrupt session status {}", record.status)))?;
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        record.status = to.as_str().to_string();
        self.persistence.update_session(record).await.map_err(AppError::Internal)?;
        self.append_activity(&record.id, "status_changed", json!({"from": from.as_str(), "to": to.as_str()}))
            .await?;
        self.notify.publish(session_event(&record.id, to.as_str())).await;
        Ok(true)
    }

    // ─── Public operations ───────────────────────────────────────────────

    pub async fn create(&self, mut config: SessionConfig) -> AppResult<Session> {
        self.validate_config(&config)?;
        if config.branch.is_none() {
            config.branch = Some(self.resolve_branch(&config.source).await?);
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let mut record = SessionRecord {
            id: id.clone(),
            status: SessionStatus::Pending.as_str().to_string(),
            config: serde_json::to_value(&config).map_err(|e| AppError::Internal(e.into()))?,
            plan: None,
            result: None,
            pr_url: None,
            created_at: now.clone(),
            updated_at: now,
        };
        self.persistence.insert_session(&record).await.map_err(AppError::Internal)?;
        self.append_activity(&id, "created", json!({"prompt": config.prompt, "source": config.source}))
            .await?;

        let body = json!({
            "prompt": config.prompt,
            "source": config.source,
            "branch": config.branch,
            "automationMode": config.automation_mode,
        });
        match self.upstream.mutate(Method::POST, "/sessions", &body, None).await {
            Ok(_) => {
                self.transition(&mut record, SessionStatus::Planning).await?;
            }
            Err(err) => {
                self.transition(&mut record, SessionStatus::Failed).await?;
                self.append_activity(&id, "failed", json!({"reason": err.to_string()})).await?;
                return Err(err);
            }
        }
        self.to_session(record).await
    }

    pub async fn get(&self, id: &str) -> AppResult<Session> {
        let record = self.load(id).await?;
        let status = SessionStatus::parse(&record.status)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("corrupt session status")))?;
        if status.is_terminal() {
            return self.to_session(record).await;
        }
        self.sync_from_upstream(id).await
    }

    /// Polls upstream once and applies whatever transition the reported
    /// phase permits. Called by `get` for non-terminal sessions and by the
    /// monitoring loop in `scheduler_loops`.
    pub async fn sync_from_upstream(&self, id: &str) -> AppResult<Session> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut record = self.load(id).await?;
        let current = SessionStatus::parse(&record.status)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("corrupt session status")))?;
        if current.is_terminal() {
            return self.to_session(record).await;
        }

        let upstream_state = self.upstream.get(&format!("/sessions/{id}"), &json!({})).await?;
        let phase = upstream_state.get("phase").and_then(Value::as_str).unwrap_or("");
        let config: SessionConfig =
            serde_json::from_value(record.config.clone()).map_err(|e| AppError::Internal(e.into()))?;

        match phase {
            "awaiting_approval" if current == SessionStatus::Planning => {
                record.plan = upstream_state.get("plan").cloned();
                self.transition(&mut record, SessionStatus::AwaitingApproval).await?;
            }
            "executing" if current == SessionStatus::Planning && !config.require_plan_approval => {
                record.plan = upstream_state.get("plan").cloned();
                self.transition(&mut record, SessionStatus::Executing).await?;
            }
            "completed" if current == SessionStatus::Executing => {
                record.result = upstream_state.get("result").cloned();
                record.pr_url = upstream_state.get("prUrl").and_then(Value::as_str).map(str::to_string);
                self.transition(&mut record, SessionStatus::Completed).await?;
            }
            "failed" => {
                record.result = upstream_state.get("result").cloned();
                self.transition(&mut record, SessionStatus::Failed).await?;
            }
            _ => {}
        }
        self.to_session(record).await
    }

    pub async fn list(&self, filter: ListFilter) -> AppResult<Vec<Session>> {
        let records = self.persistence.list_sessions().await.map_err(AppError::Internal)?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let status = SessionStatus::parse(&record.status);
            let keep = match (&filter.state, status) {
                (None, _) => true,
                (Some(s), Some(status)) if s == "running" => status.is_running(),
                (Some(s), Some(status)) => status.as_str() == s,
                (Some(_), None) => false,
            };
            if keep {
                out.push(self.to_session(record).await?);
            }
        }
        Ok(out)
    }

    pub async fn send_message(&self, id: &str, message: &str) -> AppResult<Session> {
        if message.trim().is_empty() {
            return Err(AppError::Validation("message must not be empty".to_string()));
        }
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let record = self.load(id).await?;
        let status = SessionStatus::parse(&record.status).unwrap_or(SessionStatus::Failed);
        if status.is_terminal() {
            return Err(AppError::Conflict(format!("session {id} is terminal")));
        }
        self.upstream
            .mutate(Method::POST, &format!("/sessions/{id}/messages"), &json!({"message": message}), Some(id))
            .await?;
        self.append_activity(id, "message_sent", json!({"message": message})).await?;
        self.to_session(record).await
    }

    pub async fn approve_plan(&self, id: &str) -> AppResult<Session> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut record = self.load(id).await?;
        let status = SessionStatus::parse(&record.status)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("corrupt session status")))?;
        if status != SessionStatus::AwaitingApproval {
            return Err(AppError::Conflict(format!("session {id} is not awaiting approval")));
        }
        self.upstream
            .mutate(Method::POST, &format!("/sessions/{id}/approve"), &json!({}), Some(id))
            .await?;
        self.transition(&mut record, SessionStatus::Executing).await?;
        self.to_session(record).await
    }

    pub async fn cancel(&self, id: &str) -> AppResult<Session> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut record = self.load(id).await?;
        let status = SessionStatus::parse(&record.status)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("corrupt session status")))?;
        if status.is_terminal() {
            return Err(AppError::Conflict(format!("session {id} is already terminal")));
        }
        if let Err(err) = self
            .upstream
            .mutate(Method::POST, &format!("/sessions/{id}/cancel"), &json!({}), Some(id))
            .await
        {
            warn!(session_id = id, error = %err, "upstream cancel call failed, cancelling locally anyway");
        }
        self.transition(&mut record, SessionStatus::Cancelled).await?;
        self.to_session(record).await
    }

    /// Forces a non-terminal session to `failed` with reason `timeout`,
    /// without consulting the upstream. Called by the scheduler's monitoring
    /// loop when a session's soft long-poll deadline (§5) elapses with no
    /// observed state change. A no-op (returns `false`) if the session has
    /// already reached a terminal state by the time the sweep runs.
    pub async fn fail_timeout(&self, id: &str) -> AppResult<bool> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut record = self.load(id).await?;
        let status = SessionStatus::parse(&record.status)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("corrupt session status")))?;
        if status.is_terminal() {
            return Ok(false);
        }
        let transitioned = self.transition(&mut record, SessionStatus::Failed).await?;
        if transitioned {
            self.append_activity(id, "failed", json!({"reason": "timeout"})).await?;
        }
        Ok(transitioned)
    }

    pub async fn delete(&self, id: &str) -> AppResult<()> {
        let record = self.load(id).await?;
        let status = SessionStatus::parse(&record.status).unwrap_or(SessionStatus::Failed);
        if !status.is_terminal() {
            return Err(AppError::Conflict(format!("session {id} must be terminal before deletion")));
        }
        self.persistence.delete_session(id).await.map_err(AppError::Internal)
    }

    pub async fn get_activities(&self, id: &str) -> AppResult<Vec<ActivityEntry>> {
        self.load(id).await?;
        Ok(self
            .persistence
            .list_activities(id)
            .await
            .map_err(AppError::Internal)?
            .into_iter()
            .map(ActivityEntry::from)
            .collect())
    }

    pub async fn get_diff(&self, id: &str) -> AppResult<String> {
        self.load(id).await?;
        let value = self.upstream.get(&format!("/sessions/{id}/diff"), &json!({})).await?;
        Ok(value.get("diff").and_then(Value::as_str).unwrap_or_default().to_string())
    }

    pub async fn clone_session(&self, id: &str, prompt_override: Option<String>, title_override: Option<String>) -> AppResult<Session> {
        let record = self.load(id).await?;
        let mut config: SessionConfig =
            serde_json::from_value(record.config).map_err(|e| AppError::Internal(e.into()))?;
        if let Some(p) = prompt_override {
            config.prompt = p;
        }
        if let Some(t) = title_override {
            config.title = Some(t);
        }
        // A clone re-resolves its branch unless the caller overrode the title/prompt only.
        self.create(config).await
    }

    pub async fn retry(&self, id: &str, prompt_override: Option<String>) -> AppResult<Session> {
        let record = self.load(id).await?;
        let mut config: SessionConfig =
            serde_json::from_value(record.config).map_err(|e| AppError::Internal(e.into()))?;
        if let Some(p) = prompt_override {
            config.prompt = p;
        }
        self.create(config).await
    }

    pub async fn search(&self, filter: SearchFilter) -> AppResult<Vec<Session>> {
        let records = self.persistence.list_sessions().await.map_err(AppError::Internal)?;
        let query = filter.query.as_deref().map(str::to_lowercase);
        let mut out = Vec::new();
        for record in records {
            if let Some(s) = &filter.state {
                if record.status != *s {
                    continue;
                }
            }
            if let Some(q) = &query {
                let config: SessionConfig = serde_json::from_value(record.config.clone()).unwrap_or(SessionConfig {
                    prompt: String::new(),
                    source: String::new(),
                    branch: None,
                    title: None,
                    require_plan_approval: false,
                    automation_mode: AutomationMode::None,
                });
                let title_match = config.title.as_deref().unwrap_or_default().to_lowercase().contains(q.as_str());
                let prompt_match = config.prompt.to_lowercase().contains(q.as_str());
                if !title_match && !prompt_match {
                    continue;
                }
            }
            out.push(self.to_session(record).await?);
            if let Some(limit) = filter.limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    pub async fn monitor_all(&self) -> AppResult<MonitorSnapshot> {
        let records = self.persistence.list_sessions().await.map_err(AppError::Internal)?;
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut by_state: HashMap<String, Vec<String>> = HashMap::new();
        for record in records {
            *counts.entry(record.status.clone()).or_insert(0) += 1;
            by_state.entry(record.status.clone()).or_default().push(record.id);
        }
        Ok(MonitorSnapshot { counts, by_state })
    }

    pub async fn timeline(&self, id: &str) -> AppResult<Vec<TimelineEntry>> {
        self.load(id).await?;
        let activities = self.persistence.list_activities(id).await.map_err(AppError::Internal)?;
        let mut entries = Vec::with_capacity(activities.len());
        let mut prev: Option<DateTime<Utc>> = None;
        for activity in &activities {
            let ts = DateTime::parse_from_rfc3339(&activity.timestamp).ok().map(|d| d.with_timezone(&Utc));
            let duration_since_previous_ms = match (ts, prev) {
                (Some(t), Some(p)) => Some((t - p).num_milliseconds().max(0)),
                _ => None,
            };
            entries.push(TimelineEntry {
                timestamp: activity.timestamp.clone(),
                kind: activity.kind.clone(),
                content: activity.content.clone(),
                duration_since_previous_ms,
            });
            if ts.is_some() {
                prev = ts;
            }
        }
        entries.reverse();
        Ok(entries)
    }

    /// Non-terminal session ids, for the monitoring loop to poll.
    pub async fn active_ids(&self) -> AppResult<Vec<String>> {
        let records = self.persistence.list_sessions().await.map_err(AppError::Internal)?;
        Ok(records
            .into_iter()
            .filter(|r| SessionStatus::parse(&r.status).map(|s| s.is_running()).unwrap_or(false))
            .map(|r| r.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secrets;
    use reqwest::Client;
    use std::path::Path;
    use std::time::Duration;

    async fn manager() -> SessionManager {
        let persistence = Persistence::connect(None, Path::new("/tmp/unused")).await.unwrap();
        let upstream_config = crate::upstream::UpstreamConfig {
            base_url: "https://example.test".to_string(),
            max_attempts: 1,
            retry_base: Duration::from_millis(1),
            retry_cap: Duration::from_millis(5),
            call_timeout: Duration::from_secs(5),
            cache_capacity: 10,
            cache_ttl: Duration::from_secs(5),
            circuit_failure_threshold: 5,
            circuit_open_for: Duration::from_secs(5),
        };
        let auth = Arc::new(
            crate::upstream::auth::AuthProvider::from_secrets(
                &Secrets {
                    upstream_api_key: Some("k".to_string()),
                    upstream_service_account_path: None,
                    webhook_secret: None,
                },
                Client::new(),
            )
            .unwrap(),
        );
        let upstream = UpstreamClient::new(upstream_config, auth).unwrap();
        SessionManager::new(persistence, upstream, NotificationBus::new())
    }

    #[test]
    fn source_well_formed_parses_three_components() {
        assert_eq!(source_well_formed("sources/github/acme/web"), Some(("github", "acme", "web")));
        assert_eq!(source_well_formed("sources/github/acme"), None);
    }

    #[tokio::test]
    async fn create_rejects_invalid_config() {
        let manager = manager().await;
        let config = SessionConfig {
            prompt: "short".to_string(),
            source: "sources/github/acme/web".to_string(),
            branch: None,
            title: None,
            require_plan_approval: false,
            automation_mode: AutomationMode::None,
        };
        let err = manager.create(config).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_rejects_non_terminal_session() {
        let manager = manager().await;
        let record = SessionRecord {
            id: "s1".to_string(),
            status: SessionStatus::Executing.as_str().to_string(),
            config: json!({
                "prompt": "Add health endpoint that reports ok",
                "source": "sources/github/acme/web",
            }),
            plan: None,
            result: None,
            pr_url: None,
            created_at: "t0".to_string(),
            updated_at: "t0".to_string(),
        };
        manager.persistence.insert_session(&record).await.unwrap();
        let err = manager.delete("s1").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_running_filter_excludes_terminal_sessions() {
        let manager = manager().await;
        for (id, status) in [("a", SessionStatus::Executing), ("b", SessionStatus::Completed)] {
            manager
                .persistence
                .insert_session(&SessionRecord {
                    id: id.to_string(),
                    status: status.as_str().to_string(),
                    config: json!({"prompt": "Add health endpoint that reports ok", "source": "sources/github/acme/web"}),
                    plan: None,
                    result: None,
                    pr_url: None,
                    created_at: "t0".to_string(),
                    updated_at: "t0".to_string(),
                })
                .await
                .unwrap();
        }
        let running = manager
            .list(ListFilter { state: Some("running".to_string()) })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "a");
    }
}
