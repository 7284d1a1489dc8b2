//! Durable and in-memory storage behind one interface (§4.10).
//!
//! The durable profile is SQLite via `sqlx` (WAL journal mode, a query
//! timeout wrapper, migrations applied at startup from embedded SQL files),
//! grounded on the teacher's storage layer. The in-memory profile implements
//! the same operations over mutex-guarded collections so callers are
//! agnostic to which profile is active; `/health` reports which one is live.

pub mod memory;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use memory::MemoryStore;

const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "persistence query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub status: String,
    pub config: Value,
    pub plan: Option<Value>,
    pub result: Option<Value>,
    pub pr_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub name: String,
    pub description: Option<String>,
    pub config: Value,
    pub created_at: String,
    pub usage_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItemRecord {
    pub id: String,
    pub config: Value,
    pub priority: i64,
    pub status: String,
    pub added_at: String,
    pub session_id: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: String,
    pub created_at: String,
    pub parallel: i64,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub id: String,
    pub workflow_instance: Option<String>,
    pub action_type: String,
    pub config: Option<Value>,
    pub result: Option<Value>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventEntry {
    pub id: String,
    pub source: String,
    pub event_type: String,
    pub payload: Value,
    pub processed: bool,
    pub workflow_instance: Option<String>,
    pub created_at: String,
}

/// An externally-ingested task (§4.12), materialized into exactly one
/// session on success. `next_attempt_at` gates backoff between retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestTaskRecord {
    pub id: String,
    pub source_ref: String,
    pub config: Value,
    pub status: String,
    pub retry_count: i64,
    pub max_retries: i64,
    pub next_attempt_at: String,
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone)]
enum Backend {
    Sqlite(SqlitePool),
    Memory(Arc<MemoryStore>),
}

/// The single persistence handle shared across the app. Cheaply cloneable.
#[derive(Clone)]
pub struct Persistence {
    backend: Backend,
}

impl Persistence {
    /// Connects to the durable profile if `persistence_url` is set, else
    /// falls back to the in-memory profile.
    pub async fn connect(persistence_url: Option<&str>, data_dir: &Path) -> Result<Self> {
        // Created regardless of profile: the in-memory profile still uses
        // `data_dir` for `config.toml` and the `StorageHealthCheck` probe.
        tokio::fs::create_dir_all(data_dir)
            .await
            .context("creating data directory")?;
        match persistence_url {
            Some(url) => {
                let opts = SqliteConnectOptions::from_str(url)
                    .with_context(|| format!("parsing persistence URL {url}"))?
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .create_if_missing(true);
                let pool = SqlitePool::connect_with(opts).await.context("connecting to persistence store")?;
                Self::migrate(&pool).await?;
                Ok(Self {
                    backend: Backend::Sqlite(pool),
                })
            }
            None => Ok(Self {
                backend: Backend::Memory(Arc::new(MemoryStore::new())),
            }),
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self.backend, Backend::Sqlite(_))
    }

    pub fn profile_name(&self) -> &'static str {
        if self.is_durable() {
            "sqlite"
        } else {
            "in-memory"
        }
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [
            include_str!("migrations/001_sessions.sql"),
            include_str!("migrations/002_templates.sql"),
            include_str!("migrations/003_queue.sql"),
            include_str!("migrations/004_batches.sql"),
            include_str!("migrations/005_webhooks.sql"),
            include_str!("migrations/006_workflow.sql"),
            include_str!("migrations/007_ingest_tasks.sql"),
        ] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                with_timeout(async {
                    sqlx::query("SELECT 1").execute(pool).await?;
                    Ok(())
                })
                .await
            }
            Backend::Memory(_) => Ok(()),
        }
    }

    // ─── Sessions ───────────────────────────────────────────────────────

    pub async fn insert_session(&self, record: &SessionRecord) -> Result<()> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO sessions (id, status, config, plan, result, pr_url, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&record.id)
                .bind(&record.status)
                .bind(record.config.to_string())
                .bind(record.plan.as_ref().map(|v| v.to_string()))
                .bind(record.result.as_ref().map(|v| v.to_string()))
                .bind(&record.pr_url)
                .bind(&record.created_at)
                .bind(&record.updated_at)
                .execute(pool)
                .await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.insert_session(record.clone());
                Ok(())
            }
        }
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let row = sqlx::query(
                    "SELECT id, status, config, plan, result, pr_url, created_at, updated_at FROM sessions WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(pool)
                .await?;
                Ok(row.map(session_from_row).transpose()?)
            }
            Backend::Memory(store) => Ok(store.get_session(id)),
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let rows = sqlx::query(
                    "SELECT id, status, config, plan, result, pr_url, created_at, updated_at FROM sessions ORDER BY created_at ASC",
                )
                .fetch_all(pool)
                .await?;
                rows.into_iter().map(session_from_row).collect()
            }
            Backend::Memory(store) => Ok(store.list_sessions()),
        }
    }

    /// Overwrites the full record; `updated_at` is stamped to now.
    pub async fn update_session(&self, record: &SessionRecord) -> Result<()> {
        let mut record = record.clone();
        record.updated_at = now();
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE sessions SET status = ?, config = ?, plan = ?, result = ?, pr_url = ?, updated_at = ? WHERE id = ?",
                )
                .bind(&record.status)
                .bind(record.config.to_string())
                .bind(record.plan.as_ref().map(|v| v.to_string()))
                .bind(record.result.as_ref().map(|v| v.to_string()))
                .bind(&record.pr_url)
                .bind(&record.updated_at)
                .bind(&record.id)
                .execute(pool)
                .await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.update_session(record);
                Ok(())
            }
        }
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query("DELETE FROM sessions WHERE id = ?").bind(id).execute(pool).await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.delete_session(id);
                Ok(())
            }
        }
    }

    pub async fn append_activity(&self, session_id: &str, activity: &Activity) -> Result<()> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query("INSERT INTO activities (session_id, timestamp, type, content) VALUES (?, ?, ?, ?)")
                    .bind(session_id)
                    .bind(&activity.timestamp)
                    .bind(&activity.kind)
                    .bind(activity.content.to_string())
                    .execute(pool)
                    .await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.append_activity(session_id, activity.clone());
                Ok(())
            }
        }
    }

    pub async fn list_activities(&self, session_id: &str) -> Result<Vec<Activity>> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let rows = sqlx::query("SELECT timestamp, type, content FROM activities WHERE session_id = ? ORDER BY id ASC")
                    .bind(session_id)
                    .fetch_all(pool)
                    .await?;
                rows.into_iter()
                    .map(|row| {
                        let content: String = row.try_get("content")?;
                        Ok(Activity {
                            timestamp: row.try_get("timestamp")?,
                            kind: row.try_get("type")?,
                            content: serde_json::from_str(&content).unwrap_or(Value::Null),
                        })
                    })
                    .collect::<Result<Vec<_>, sqlx::Error>>()
                    .map_err(Into::into)
            }
            Backend::Memory(store) => Ok(store.list_activities(session_id)),
        }
    }

    // ─── Templates ──────────────────────────────────────────────────────

    /// Returns `true` if inserted, `false` on a duplicate name.
    pub async fn insert_template(&self, record: &TemplateRecord) -> Result<bool> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let result = sqlx::query(
                    "INSERT INTO templates (name, description, config, created_at, usage_count) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&record.name)
                .bind(&record.description)
                .bind(record.config.to_string())
                .bind(&record.created_at)
                .bind(record.usage_count)
                .execute(pool)
                .await;
                match result {
                    Ok(_) => Ok(true),
                    Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            Backend::Memory(store) => Ok(store.insert_template(record.clone())),
        }
    }

    pub async fn get_template(&self, name: &str) -> Result<Option<TemplateRecord>> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let row = sqlx::query("SELECT name, description, config, created_at, usage_count FROM templates WHERE name = ?")
                    .bind(name)
                    .fetch_optional(pool)
                    .await?;
                row.map(template_from_row).transpose()
            }
            Backend::Memory(store) => Ok(store.get_template(name)),
        }
    }

    pub async fn list_templates(&self) -> Result<Vec<TemplateRecord>> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let rows = sqlx::query("SELECT name, description, config, created_at, usage_count FROM templates ORDER BY created_at ASC")
                    .fetch_all(pool)
                    .await?;
                rows.into_iter().map(template_from_row).collect()
            }
            Backend::Memory(store) => Ok(store.list_templates()),
        }
    }

    pub async fn delete_template(&self, name: &str) -> Result<bool> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let result = sqlx::query("DELETE FROM templates WHERE name = ?").bind(name).execute(pool).await?;
                Ok(result.rows_affected() > 0)
            }
            Backend::Memory(store) => Ok(store.delete_template(name)),
        }
    }

    pub async fn increment_template_usage(&self, name: &str) -> Result<()> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query("UPDATE templates SET usage_count = usage_count + 1 WHERE name = ?")
                    .bind(name)
                    .execute(pool)
                    .await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.increment_template_usage(name);
                Ok(())
            }
        }
    }

    pub async fn count_templates(&self) -> Result<i64> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let row = sqlx::query("SELECT COUNT(*) AS n FROM templates").fetch_one(pool).await?;
                Ok(row.try_get::<i64, _>("n")?)
            }
            Backend::Memory(store) => Ok(store.count_templates()),
        }
    }

    // ─── Queue items ────────────────────────────────────────────────────

    pub async fn insert_queue_item(&self, record: &QueueItemRecord) -> Result<()> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO queue_items (id, config, priority, status, added_at, session_id, completed_at, error) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&record.id)
                .bind(record.config.to_string())
                .bind(record.priority)
                .bind(&record.status)
                .bind(&record.added_at)
                .bind(&record.session_id)
                .bind(&record.completed_at)
                .bind(&record.error)
                .execute(pool)
                .await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.insert_queue_item(record.clone());
                Ok(())
            }
        }
    }

    pub async fn update_queue_item(&self, record: &QueueItemRecord) -> Result<()> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE queue_items SET status = ?, session_id = ?, completed_at = ?, error = ? WHERE id = ?",
                )
                .bind(&record.status)
                .bind(&record.session_id)
                .bind(&record.completed_at)
                .bind(&record.error)
                .bind(&record.id)
                .execute(pool)
                .await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.update_queue_item(record.clone());
                Ok(())
            }
        }
    }

    pub async fn list_queue_items(&self) -> Result<Vec<QueueItemRecord>> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let rows = sqlx::query(
                    "SELECT id, config, priority, status, added_at, session_id, completed_at, error FROM queue_items ORDER BY added_at ASC",
                )
                .fetch_all(pool)
                .await?;
                rows.into_iter().map(queue_item_from_row).collect()
            }
            Backend::Memory(store) => Ok(store.list_queue_items()),
        }
    }

    pub async fn clear_pending_queue_items(&self) -> Result<u64> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let result = sqlx::query("DELETE FROM queue_items WHERE status = 'pending'").execute(pool).await?;
                Ok(result.rows_affected())
            }
            Backend::Memory(store) => Ok(store.clear_pending_queue_items()),
        }
    }

    /// Evicts the oldest terminal items beyond `keep`.
    pub async fn prune_terminal_queue_items(&self, keep: i64) -> Result<u64> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                with_timeout(async {
                    let result = sqlx::query(
                        "DELETE FROM queue_items WHERE id IN ( \
                            SELECT id FROM queue_items WHERE status IN ('completed','failed') \
                            ORDER BY added_at ASC \
                            LIMIT MAX(0, (SELECT COUNT(*) FROM queue_items WHERE status IN ('completed','failed')) - ?) \
                        )",
                    )
                    .bind(keep)
                    .execute(pool)
                    .await?;
                    Ok(result.rows_affected())
                })
                .await
            }
            Backend::Memory(store) => Ok(store.prune_terminal_queue_items(keep.max(0) as usize)),
        }
    }

    // ─── Batches ────────────────────────────────────────────────────────

    pub async fn insert_batch(&self, record: &BatchRecord) -> Result<()> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query("INSERT INTO batches (id, created_at, parallel, members) VALUES (?, ?, ?, ?)")
                    .bind(&record.id)
                    .bind(&record.created_at)
                    .bind(record.parallel)
                    .bind(serde_json::to_string(&record.members)?)
                    .execute(pool)
                    .await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.insert_batch(record.clone());
                Ok(())
            }
        }
    }

    pub async fn get_batch(&self, id: &str) -> Result<Option<BatchRecord>> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let row = sqlx::query("SELECT id, created_at, parallel, members FROM batches WHERE id = ?")
                    .bind(id)
                    .fetch_optional(pool)
                    .await?;
                row.map(batch_from_row).transpose()
            }
            Backend::Memory(store) => Ok(store.get_batch(id)),
        }
    }

    pub async fn list_batches(&self) -> Result<Vec<BatchRecord>> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let rows = sqlx::query("SELECT id, created_at, parallel, members FROM batches ORDER BY created_at ASC")
                    .fetch_all(pool)
                    .await?;
                rows.into_iter().map(batch_from_row).collect()
            }
            Backend::Memory(store) => Ok(store.list_batches()),
        }
    }

    /// Overwrites a batch's `members` list (e.g. after a retry swaps a
    /// failed member's session id for a fresh one).
    pub async fn update_batch_members(&self, id: &str, members: &[String]) -> Result<()> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query("UPDATE batches SET members = ? WHERE id = ?")
                    .bind(serde_json::to_string(members)?)
                    .bind(id)
                    .execute(pool)
                    .await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.update_batch_members(id, members.to_vec());
                Ok(())
            }
        }
    }

    // ─── Webhook dedup & audit ──────────────────────────────────────────

    /// Atomically claims `(service_id, deploy_id)`. Returns `true` if this
    /// call performed the claim.
    pub async fn try_claim_remediation(&self, service_id: &str, deploy_id: &str, session_id: &str) -> Result<bool> {
        let created_at = now();
        match &self.backend {
            Backend::Sqlite(pool) => {
                let result = sqlx::query(
                    "INSERT INTO deploy_remediations (service_id, deploy_id, session_id, created_at) VALUES (?, ?, ?, ?)",
                )
                .bind(service_id)
                .bind(deploy_id)
                .bind(session_id)
                .bind(&created_at)
                .execute(pool)
                .await;
                match result {
                    Ok(_) => Ok(true),
                    Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            Backend::Memory(store) => Ok(store.try_claim_remediation(service_id, deploy_id, session_id, &created_at)),
        }
    }

    /// Fills in the real session id once the remediation session has been
    /// created (the dedup claim itself is made before that id exists, with
    /// an empty placeholder).
    pub async fn set_remediation_session(&self, service_id: &str, deploy_id: &str, session_id: &str) -> Result<()> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query("UPDATE deploy_remediations SET session_id = ? WHERE service_id = ? AND deploy_id = ?")
                    .bind(session_id)
                    .bind(service_id)
                    .bind(deploy_id)
                    .execute(pool)
                    .await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.set_remediation_session(service_id, deploy_id, session_id);
                Ok(())
            }
        }
    }

    pub async fn reap_remediations_older_than(&self, cutoff: &str) -> Result<u64> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let result = sqlx::query("DELETE FROM deploy_remediations WHERE created_at < ?")
                    .bind(cutoff)
                    .execute(pool)
                    .await?;
                Ok(result.rows_affected())
            }
            Backend::Memory(store) => Ok(store.reap_remediations_older_than(cutoff)),
        }
    }

    pub async fn log_action(&self, entry: &ActionLogEntry) -> Result<()> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO action_log (id, workflow_instance, action_type, config, result, success, error, duration_ms, timestamp) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&entry.id)
                .bind(&entry.workflow_instance)
                .bind(&entry.action_type)
                .bind(entry.config.as_ref().map(|v| v.to_string()))
                .bind(entry.result.as_ref().map(|v| v.to_string()))
                .bind(entry.success)
                .bind(&entry.error)
                .bind(entry.duration_ms)
                .bind(&entry.timestamp)
                .execute(pool)
                .await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.log_action(entry.clone());
                Ok(())
            }
        }
    }

    pub async fn list_action_log(&self) -> Result<Vec<ActionLogEntry>> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let rows = sqlx::query(
                    "SELECT id, workflow_instance, action_type, config, result, success, error, duration_ms, timestamp FROM action_log ORDER BY timestamp ASC",
                )
                .fetch_all(pool)
                .await?;
                rows.into_iter().map(action_log_from_row).collect()
            }
            Backend::Memory(store) => Ok(store.list_action_log()),
        }
    }

    pub async fn record_webhook_event(&self, entry: &WebhookEventEntry) -> Result<()> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO webhook_events (id, source, event_type, payload, processed, workflow_instance, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&entry.id)
                .bind(&entry.source)
                .bind(&entry.event_type)
                .bind(entry.payload.to_string())
                .bind(entry.processed)
                .bind(&entry.workflow_instance)
                .bind(&entry.created_at)
                .execute(pool)
                .await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.record_webhook_event(entry.clone());
                Ok(())
            }
        }
    }

    // ─── Ingest tasks (external task queue, §4.12) ─────────────────────

    pub async fn insert_ingest_task(&self, record: &IngestTaskRecord) -> Result<()> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO ingest_tasks (id, source_ref, config, status, retry_count, max_retries, next_attempt_at, session_id, error, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&record.id)
                .bind(&record.source_ref)
                .bind(record.config.to_string())
                .bind(&record.status)
                .bind(record.retry_count)
                .bind(record.max_retries)
                .bind(&record.next_attempt_at)
                .bind(&record.session_id)
                .bind(&record.error)
                .bind(&record.created_at)
                .bind(&record.updated_at)
                .execute(pool)
                .await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.insert_ingest_task(record.clone());
                Ok(())
            }
        }
    }

    pub async fn update_ingest_task(&self, record: &IngestTaskRecord) -> Result<()> {
        let mut record = record.clone();
        record.updated_at = now();
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE ingest_tasks SET status = ?, retry_count = ?, next_attempt_at = ?, session_id = ?, error = ?, updated_at = ? WHERE id = ?",
                )
                .bind(&record.status)
                .bind(record.retry_count)
                .bind(&record.next_attempt_at)
                .bind(&record.session_id)
                .bind(&record.error)
                .bind(&record.updated_at)
                .bind(&record.id)
                .execute(pool)
                .await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.update_ingest_task(record);
                Ok(())
            }
        }
    }

    pub async fn list_ingest_tasks(&self) -> Result<Vec<IngestTaskRecord>> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let rows = sqlx::query(
                    "SELECT id, source_ref, config, status, retry_count, max_retries, next_attempt_at, session_id, error, created_at, updated_at FROM ingest_tasks ORDER BY created_at ASC",
                )
                .fetch_all(pool)
                .await?;
                rows.into_iter().map(ingest_task_from_row).collect()
            }
            Backend::Memory(store) => Ok(store.list_ingest_tasks()),
        }
    }

    // ─── Maintenance ────────────────────────────────────────────────────

    pub async fn vacuum(&self) -> Result<()> {
        if let Backend::Sqlite(pool) = &self.backend {
            sqlx::query("VACUUM").execute(pool).await?;
        }
        Ok(())
    }
}

fn session_from_row(row: sqlx::sqlite::SqliteRow) -> Result<SessionRecord, sqlx::Error> {
    let config: String = row.try_get("config")?;
    let plan: Option<String> = row.try_get("plan")?;
    let result: Option<String> = row.try_get("result")?;
    Ok(SessionRecord {
        id: row.try_get("id")?,
        status: row.try_get("status")?,
        config: serde_json::from_str(&config).unwrap_or(Value::Null),
        plan: plan.and_then(|s| serde_json::from_str(&s).ok()),
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        pr_url: row.try_get("pr_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn template_from_row(row: sqlx::sqlite::SqliteRow) -> Result<TemplateRecord> {
    let config: String = row.try_get("config")?;
    Ok(TemplateRecord {
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        config: serde_json::from_str(&config).unwrap_or(Value::Null),
        created_at: row.try_get("created_at")?,
        usage_count: row.try_get("usage_count")?,
    })
}

fn queue_item_from_row(row: sqlx::sqlite::SqliteRow) -> Result<QueueItemRecord, sqlx::Error> {
    let config: String = row.try_get("config")?;
    Ok(QueueItemRecord {
        id: row.try_get("id")?,
        config: serde_json::from_str(&config).unwrap_or(Value::Null),
        priority: row.try_get("priority")?,
        status: row.try_get("status")?,
        added_at: row.try_get("added_at")?,
        session_id: row.try_get("session_id")?,
        completed_at: row.try_get("completed_at")?,
        error: row.try_get("error")?,
    })
}

fn batch_from_row(row: sqlx::sqlite::SqliteRow) -> Result<BatchRecord> {
    let members: String = row.try_get("members")?;
    Ok(BatchRecord {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        parallel: row.try_get("parallel")?,
        members: serde_json::from_str(&members).unwrap_or_default(),
    })
}

fn action_log_from_row(row: sqlx::sqlite::SqliteRow) -> Result<ActionLogEntry, sqlx::Error> {
    let config: Option<String> = row.try_get("config")?;
    let result: Option<String> = row.try_get("result")?;
    Ok(ActionLogEntry {
        id: row.try_get("id")?,
        workflow_instance: row.try_get("workflow_instance")?,
        action_type: row.try_get("action_type")?,
        config: config.and_then(|s| serde_json::from_str(&s).ok()),
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        success: row.try_get("success")?,
        error: row.try_get("error")?,
        duration_ms: row.try_get("duration_ms")?,
        timestamp: row.try_get("timestamp")?,
    })
}

fn ingest_task_from_row(row: sqlx::sqlite::SqliteRow) -> Result<IngestTaskRecord, sqlx::Error> {
    let config: String = row.try_get("config")?;
    Ok(IngestTaskRecord {
        id: row.try_get("id")?,
        source_ref: row.try_get("source_ref")?,
        config: serde_json::from_str(&config).unwrap_or(Value::Null),
        status: row.try_get("status")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        session_id: row.try_get("session_id")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory() -> Persistence {
        Persistence::connect(None, Path::new("/tmp/unused")).await.unwrap()
    }

    #[tokio::test]
    async fn memory_profile_round_trips_a_session() {
        let p = memory().await;
        assert!(!p.is_durable());
        let record = SessionRecord {
            id: "s1".to_string(),
            status: "pending".to_string(),
            config: json!({"prompt": "hi"}),
            plan: None,
            result: None,
            pr_url: None,
            created_at: "t0".to_string(),
            updated_at: "t0".to_string(),
        };
        p.insert_session(&record).await.unwrap();
        let fetched = p.get_session("s1").await.unwrap().unwrap();
        assert_eq!(fetched.config, json!({"prompt": "hi"}));
    }

    #[tokio::test]
    async fn template_cap_is_enforced_by_caller_via_count() {
        let p = memory().await;
        let record = TemplateRecord {
            name: "t1".to_string(),
            description: None,
            config: json!({}),
            created_at: "t0".to_string(),
            usage_count: 0,
        };
        assert!(p.insert_template(&record).await.unwrap());
        assert!(!p.insert_template(&record).await.unwrap());
        assert_eq!(p.count_templates().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remediation_dedup_claims_exactly_once() {
        let p = memory().await;
        assert!(p.try_claim_remediation("svc", "d1", "sess-a").await.unwrap());
        assert!(!p.try_claim_remediation("svc", "d1", "sess-b").await.unwrap());
    }
}
