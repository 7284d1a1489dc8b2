//! The Batch Processor (§4.5): creates and drives a group of sessions under
//! a bounded concurrency budget.
//!
//! Dispatch follows the teacher's pool-worker idiom (`process_pool.rs`'s
//! `VecDeque` of pending work behind a `Mutex`): tasks beyond the `parallel`
//! budget wait in a per-batch queue and are admitted one at a time as
//! dispatched members reach a terminal state. `members` is persisted as an
//! ordered `Vec<String>` of session ids; a task that has not yet been
//! admitted holds a `pending:{idx}` placeholder in its slot so callers can
//! see its original position before it has a session at all. A task that
//! fails before a session record ever exists (a config validation error)
//! holds an `invalid:{uuid}` placeholder instead — both placeholder kinds
//! are resolved against in-process scheduling state, not the `sessions`
//! table, which is why that state does not survive a restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::persistence::{BatchRecord, Persistence};
use crate::session::{SessionConfig, SessionManager, SessionStatus};

#[derive(Debug, Clone, Serialize)]
pub struct BatchMember {
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    pub parallel: i64,
    pub members: Vec<BatchMember>,
    pub counts: HashMap<String, usize>,
}

/// In-process admission state for one batch. Not persisted: a restart loses
/// track of not-yet-admitted tasks and of the configs behind `invalid:`
/// placeholders, which is an accepted limitation for a scheduling concern
/// rather than durable business data.
struct PendingBatch {
    pending: VecDeque<(usize, SessionConfig)>,
    invalid: HashMap<String, (SessionConfig, String)>,
}

/// Owns batch admission and status aggregation. Cheaply cloneable.
#[derive(Clone)]
pub struct BatchManager {
    persistence: Persistence,
    hard_cap: usize,
    state: Arc<Mutex<HashMap<String, PendingBatch>>>,
}

impl BatchManager {
    pub fn new(persistence: Persistence, hard_cap: usize) -> Self {
        Self {
            persistence,
            hard_cap,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Admits the first `parallel` tasks now (in input order) and queues the
    /// rest for admission as slots free up. `0` is coerced to `1`; values
    /// above the hard cap are coerced down to it.
    pub async fn create_batch(
        &self,
        tasks: Vec<SessionConfig>,
        parallel: Option<usize>,
        sessions: &SessionManager,
    ) -> AppResult<BatchStatus> {
        if tasks.is_empty() {
            return Err(AppError::Validation("batch requires at least one task".to_string()));
        }
        let requested = parallel.unwrap_or(self.hard_cap);
        let parallel = requested.max(1).min(self.hard_cap) as i64;
        let admit_now = parallel as usize;

        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();

        let mut members = Vec::with_capacity(tasks.len());
        let mut pending = VecDeque::new();
        let mut invalid = HashMap::new();

        for (idx, task) in tasks.into_iter().enumerate() {
            if idx < admit_now {
                members.push(self.dispatch(task, sessions, &mut invalid).await);
            } else {
                members.push(format!("pending:{idx}"));
                pending.push_back((idx, task));
            }
        }

        let record = BatchRecord {
            id: id.clone(),
            created_at,
            parallel,
            members,
        };
        self.persistence.insert_batch(&record).await.map_err(AppError::Internal)?;
        self.state.lock().await.insert(id, PendingBatch { pending, invalid });

        self.to_status(record, sessions).await
    }

    async fn dispatch(
        &self,
        config: SessionConfig,
        sessions: &SessionManager,
        invalid: &mut HashMap<String, (SessionConfig, String)>,
    ) -> String {
        match sessions.create(config.clone()).await {
            Ok(session) => session.id,
            Err(err) => {
                let sentinel = format!("invalid:{}", Uuid::new_v4());
                invalid.insert(sentinel.clone(), (config, err.to_string()));
                sentinel
            }
        }
    }

    /// Admits queued tasks up to the batch's `parallel` budget, counting any
    /// already-dispatched member whose session has not yet reached a
    /// terminal state against that budget. A no-op for batches with nothing
    /// left to admit.
    pub async fn tick(&self, batch_id: &str, sessions: &SessionManager) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let Some(pending_batch) = state.get_mut(batch_id) else {
            return Ok(());
        };
        if pending_batch.pending.is_empty() {
            return Ok(());
        }
        let Some(mut record) = self.persistence.get_batch(batch_id).await.map_err(AppError::Internal)? else {
            return Ok(());
        };

        let mut non_terminal = 0i64;
        for member in &record.members {
            if member.starts_with("pending:") || member.starts_with("invalid:") {
                continue;
            }
            if let Ok(session) = sessions.get(member).await {
                if !session.status.is_terminal() {
                    non_terminal += 1;
                }
            }
        }

        let mut changed = false;
        while non_terminal < record.parallel {
            let Some((idx, config)) = pending_batch.pending.pop_front() else {
                break;
            };
            record.members[idx] = self.dispatch(config, sessions, &mut pending_batch.invalid).await;
            non_terminal += 1;
            changed = true;
        }
        drop(state);

        if changed {
            self.persistence
                .update_batch_members(batch_id, &record.members)
                .await
                .map_err(AppError::Internal)?;
        }
        Ok(())
    }

    /// Runs `tick` for every batch with queued, not-yet-admitted tasks.
    /// Called periodically by the scheduler loops so batches make progress
    /// even when nothing is actively polling `getBatchStatus`.
    pub async fn tick_all(&self, sessions: &SessionManager) -> AppResult<()> {
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            state
                .iter()
                .filter(|(_, b)| !b.pending.is_empty())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.tick(&id, sessions).await?;
        }
        Ok(())
    }

    async fn member_status(
        &self,
        member_id: &str,
        sessions: &SessionManager,
        invalid: &HashMap<String, (SessionConfig, String)>,
    ) -> BatchMember {
        if member_id.starts_with("pending:") {
            return BatchMember {
                session_id: None,
                status: "pending".to_string(),
                error: None,
            };
        }
        if let Some((_, error)) = invalid.get(member_id) {
            return BatchMember {
                session_id: None,
                status: "failed".to_string(),
                error: Some(error.clone()),
            };
        }
        match sessions.get(member_id).await {
            Ok(session) => BatchMember {
                session_id: Some(session.id),
                status: session.status.as_str().to_string(),
                error: None,
            },
            Err(_) => BatchMember {
                session_id: Some(member_id.to_string()),
                status: "unknown".to_string(),
                error: None,
            },
        }
    }

    async fn to_status(&self, record: BatchRecord, sessions: &SessionManager) -> AppResult<BatchStatus> {
        let invalid = {
            let state = self.state.lock().await;
            state.get(&record.id).map(|b| b.invalid.clone()).unwrap_or_default()
        };

        let mut members = Vec::with_capacity(record.members.len());
        let mut counts: HashMap<String, usize> = HashMap::new();
        for member_id in &record.members {
            let member = self.member_status(member_id, sessions, &invalid).await;
            *counts.entry(member.status.clone()).or_insert(0) += 1;
            members.push(member);
        }
        Ok(BatchStatus {
            id: record.id,
            created_at: record.created_at,
            parallel: record.parallel,
            members,
            counts,
        })
    }

    pub async fn get_batch_status(&self, id: &str, sessions: &SessionManager) -> AppResult<BatchStatus> {
        self.tick(id, sessions).await?;
        let record = self
            .persistence
            .get_batch(id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::NotFound(format!("batch {id} not found")))?;
        self.to_status(record, sessions).await
    }

    pub async fn list_batches(&self, sessions: &SessionManager) -> AppResult<Vec<BatchStatus>> {
        let records = self.persistence.list_batches().await.map_err(AppError::Internal)?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push(self.to_status(record, sessions).await?);
        }
        Ok(out)
    }

    /// Approves every currently `awaiting_approval` member. Pending and
    /// invalid placeholders are skipped.
    pub async fn approve_all_in_batch(&self, id: &str, sessions: &SessionManager) -> AppResult<BatchStatus> {
        let record = self
            .persistence
            .get_batch(id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::NotFound(format!("batch {id} not found")))?;

        for member in &record.members {
            if member.starts_with("pending:") || member.starts_with("invalid:") {
                continue;
            }
            if let Ok(session) = sessions.get(member).await {
                if session.status == SessionStatus::AwaitingApproval {
                    sessions.approve_plan(member).await?;
                }
            }
        }
        self.get_batch_status(id, sessions).await
    }

    /// Retries every currently-failed member exactly once, preserving its
    /// original slot. A member still waiting on a `pending:` placeholder is
    /// untouched; an `invalid:` placeholder is retried by re-dispatching its
    /// original config.
    pub async fn retry_failed_in_batch(&self, id: &str, sessions: &SessionManager) -> AppResult<BatchStatus> {
        let mut record = self
            .persistence
            .get_batch(id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::NotFound(format!("batch {id} not found")))?;

        let mut state = self.state.lock().await;
        let pending_batch = state
            .entry(id.to_string())
            .or_insert_with(|| PendingBatch {
                pending: VecDeque::new(),
                invalid: HashMap::new(),
            });

        let mut changed = false;
        for member in record.members.iter_mut() {
            if member.starts_with("pending:") {
                continue;
            }
            if member.starts_with("invalid:") {
                if let Some((config, _)) = pending_batch.invalid.remove(member) {
                    *member = self.dispatch(config, sessions, &mut pending_batch.invalid).await;
                    changed = true;
                }
                continue;
            }
            if let Ok(session) = sessions.get(member).await {
                if session.status == SessionStatus::Failed {
                    if let Ok(new_session) = sessions.retry(member, None).await {
                        *member = new_session.id;
                        changed = true;
                    }
                }
            }
        }
        drop(state);

        if changed {
            self.persistence
                .update_batch_members(id, &record.members)
                .await
                .map_err(AppError::Internal)?;
        }
        self.get_batch_status(id, sessions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secrets;
    use crate::notify::NotificationBus;
    use crate::upstream::{UpstreamClient, UpstreamConfig};
    use reqwest::Client;
    use std::path::Path;
    use std::time::Duration;

    async fn harness(hard_cap: usize) -> (BatchManager, SessionManager) {
        let persistence = Persistence::connect(None, Path::new("/tmp/unused")).await.unwrap();
        let upstream_config = UpstreamConfig {
            base_url: "https://example.test".to_string(),
            max_attempts: 1,
            retry_base: Duration::from_millis(1),
            retry_cap: Duration::from_millis(5),
            call_timeout: Duration::from_secs(1),
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
        let sessions = SessionManager::new(persistence.clone(), upstream, NotificationBus::new());
        (BatchManager::new(persistence, hard_cap), sessions)
    }

    fn task(n: usize) -> SessionConfig {
        SessionConfig {
            prompt: format!("task {n}"),
            source: "sources/github/acme/widgets".to_string(),
            branch: Some("main".to_string()),
            title: None,
            require_plan_approval: false,
            automation_mode: Default::default(),
        }
    }

    #[tokio::test]
    async fn create_batch_coerces_parallel_bounds() {
        let (batches, sessions) = harness(8).await;
        let status = batches
            .create_batch(vec![task(1)], Some(0), &sessions)
            .await
            .unwrap();
        assert_eq!(status.parallel, 1);

        let status = batches
            .create_batch(vec![task(1)], Some(99), &sessions)
            .await
            .unwrap();
        assert_eq!(status.parallel, 8);
    }

    #[tokio::test]
    async fn empty_task_list_is_validation_error() {
        let (batches, sessions) = harness(8).await;
        let err = batches.create_batch(vec![], None, &sessions).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn admits_only_up_to_parallel_budget() {
        let (batches, sessions) = harness(8).await;
        let tasks = (0..5).map(task).collect::<Vec<_>>();
        let status = batches.create_batch(tasks, Some(2), &sessions).await.unwrap();
        let pending_count = status.members.iter().filter(|m| m.status == "pending").count();
        assert_eq!(pending_count, 3);
    }

    #[tokio::test]
    async fn list_batches_includes_created_batch() {
        let (batches, sessions) = harness(8).await;
        let created = batches.create_batch(vec![task(1)], None, &sessions).await.unwrap();
        let all = batches.list_batches(&sessions).await.unwrap();
        assert!(all.iter().any(|b| b.id == created.id));
    }

    #[tokio::test]
    async fn missing_batch_is_not_found() {
        let (batches, sessions) = harness(8).await;
        let err = batches.get_batch_status("nope", &sessions).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
