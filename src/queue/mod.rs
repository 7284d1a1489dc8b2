//! The Priority Queue (§4.6): a deferred-session admission buffer.
//!
//! Lower `priority` value wins; ties break by ascending `addedAt`. An item is
//! claimed by flipping it to `processing` before any upstream call is made,
//! so only one driver can carry a given item to a terminal state. Grounded
//! on the teacher's `scheduler/queue.rs` `BinaryHeap`-backed scheduler queue,
//! with the ordering inverted (there, a higher `u8` priority pops first).

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::persistence::{Persistence, QueueItemRecord};
use crate::session::{Session, SessionConfig, SessionManager};

#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub id: String,
    pub config: Value,
    pub priority: i64,
    pub status: String,
    #[serde(rename = "addedAt")]
    pub added_at: String,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<QueueItemRecord> for QueueItem {
    fn from(r: QueueItemRecord) -> Self {
        Self {
            id: r.id,
            config: r.config,
            priority: r.priority,
            status: r.status,
            added_at: r.added_at,
            session_id: r.session_id,
            completed_at: r.completed_at,
            error: r.error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub counts: HashMap<String, usize>,
}

/// Owns the pending/processing/terminal queue. Cheaply cloneable.
///
/// `claim` serializes `process_queue` callers so at most one driver at a
/// time pulls the next item and flips it to `processing`; concurrent reads
/// via `list`/`get_next`/`stats` take no lock.
#[derive(Clone)]
pub struct QueueManager {
    persistence: Persistence,
    max_retained: i64,
    claim: std::sync::Arc<Mutex<()>>,
}

impl QueueManager {
    pub fn new(persistence: Persistence, max_retained: usize) -> Self {
        Self {
            persistence,
            max_retained: max_retained as i64,
            claim: std::sync::Arc::new(Mutex::new(())),
        }
    }

    pub async fn add(&self, config: Value, priority: i64) -> AppResult<QueueItem> {
        let record = QueueItemRecord {
            id: Uuid::new_v4().to_string(),
            config,
            priority,
            status: "pending".to_string(),
            added_at: Utc::now().to_rfc3339(),
            session_id: None,
            completed_at: None,
            error: None,
        };
        self.persistence.insert_queue_item(&record).await.map_err(AppError::Internal)?;
        Ok(record.into())
    }

    /// Returns the highest-priority pending item without claiming it.
    pub async fn get_next(&self) -> AppResult<Option<QueueItem>> {
        let items = self.persistence.list_queue_items().await.map_err(AppError::Internal)?;
        let next = items
            .into_iter()
            .filter(|i| i.status == "pending")
            .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.added_at.cmp(&b.added_at)));
        Ok(next.map(QueueItem::from))
    }

    async fn load(&self, id: &str) -> AppResult<QueueItemRecord> {
        self.persistence
            .list_queue_items()
            .await
            .map_err(AppError::Internal)?
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| AppError::NotFound(format!("queue item {id} not found")))
    }

    pub async fn mark_processing(&self, id: &str) -> AppResult<QueueItem> {
        let mut record = self.load(id).await?;
        if record.status != "pending" {
            return Err(AppError::Conflict(format!("queue item {id} is not pending")));
        }
        record.status = "processing".to_string();
        self.persistence.update_queue_item(&record).await.map_err(AppError::Internal)?;
        Ok(record.into())
    }

    pub async fn mark_complete(&self, id: &str, session_id: &str) -> AppResult<QueueItem> {
        let mut record = self.load(id).await?;
        record.status = "completed".to_string();
        record.session_id = Some(session_id.to_string());
        record.completed_at = Some(Utc::now().to_rfc3339());
        self.persistence.update_queue_item(&record).await.map_err(AppError::Internal)?;
        self.prune().await?;
        Ok(record.into())
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> AppResult<QueueItem> {
        let mut record = self.load(id).await?;
        record.status = "failed".to_string();
        record.error = Some(error.to_string());
        record.completed_at = Some(Utc::now().to_rfc3339());
        self.persistence.update_queue_item(&record).await.map_err(AppError::Internal)?;
        self.prune().await?;
        Ok(record.into())
    }

    pub async fn list(&self) -> AppResult<Vec<QueueItem>> {
        Ok(self
            .persistence
            .list_queue_items()
            .await
            .map_err(AppError::Internal)?
            .into_iter()
            .map(QueueItem::from)
            .collect())
    }

    pub async fn stats(&self) -> AppResult<QueueStats> {
        let items = self.persistence.list_queue_items().await.map_err(AppError::Internal)?;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for item in &items {
            *counts.entry(item.status.clone()).or_insert(0) += 1;
        }
        let depth = counts.get("pending").copied().unwrap_or(0);
        Ok(QueueStats { depth, counts })
    }

    /// Removes pending items only; processing/terminal items are untouched.
    pub async fn clear(&self) -> AppResult<u64> {
        self.persistence.clear_pending_queue_items().await.map_err(AppError::Internal)
    }

    async fn prune(&self) -> AppResult<()> {
        self.persistence
            .prune_terminal_queue_items(self.max_retained)
            .await
            .map_err(AppError::Internal)?;
        Ok(())
    }

    /// Atomically claims and drains the next pending item: flips it to
    /// `processing`, creates a session from its stored config via the
    /// Session Manager, and records the outcome. Returns `Ok(None)` when the
    /// queue is empty.
    pub async fn process_queue(&self, sessions: &SessionManager) -> AppResult<Option<QueueItem>> {
        let _guard = self.claim.lock().await;

        let Some(next) = self.get_next().await? else {
            return Ok(None);
        };
        let claimed = self.mark_processing(&next.id).await?;

        let config: SessionConfig = match serde_json::from_value(claimed.config.clone()) {
            Ok(c) => c,
            Err(e) => {
                let failed = self.mark_failed(&claimed.id, &format!("invalid queued config: {e}")).await?;
                return Ok(Some(failed));
            }
        };

        match sessions.create(config).await {
            Ok(Session { id, .. }) => Ok(Some(self.mark_complete(&claimed.id, &id).await?)),
            Err(err) => Ok(Some(self.mark_failed(&claimed.id, &err.to_string()).await?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    async fn manager() -> QueueManager {
        let persistence = Persistence::connect(None, Path::new("/tmp/unused")).await.unwrap();
        QueueManager::new(persistence, 100)
    }

    #[tokio::test]
    async fn get_next_picks_lowest_priority_then_earliest() {
        let m = manager().await;
        // priorities [5, 1, 3, 1] in insertion order.
        let item1 = m.add(json!({"n": 1}), 5).await.unwrap();
        let item2 = m.add(json!({"n": 2}), 1).await.unwrap();
        let item3 = m.add(json!({"n": 3}), 3).await.unwrap();
        let item4 = m.add(json!({"n": 4}), 1).await.unwrap();

        let next = m.get_next().await.unwrap().unwrap();
        assert_eq!(next.id, item2.id);
        m.mark_processing(&item2.id).await.unwrap();
        m.mark_complete(&item2.id, "s1").await.unwrap();

        let next = m.get_next().await.unwrap().unwrap();
        assert_eq!(next.id, item4.id);
        m.mark_processing(&item4.id).await.unwrap();
        m.mark_complete(&item4.id, "s2").await.unwrap();

        let next = m.get_next().await.unwrap().unwrap();
        assert_eq!(next.id, item3.id);
        m.mark_processing(&item3.id).await.unwrap();
        m.mark_complete(&item3.id, "s3").await.unwrap();

        let next = m.get_next().await.unwrap().unwrap();
        assert_eq!(next.id, item1.id);
    }

    #[tokio::test]
    async fn clear_only_removes_pending() {
        let m = manager().await;
        let a = m.add(json!({}), 1).await.unwrap();
        let b = m.add(json!({}), 2).await.unwrap();
        m.mark_processing(&a.id).await.unwrap();
        m.mark_complete(&a.id, "s1").await.unwrap();
        let removed = m.clear().await.unwrap();
        assert_eq!(removed, 1);
        let remaining = m.list().await.unwrap();
        assert!(remaining.iter().any(|i| i.id == a.id));
        assert!(!remaining.iter().any(|i| i.id == b.id));
    }

    #[tokio::test]
    async fn mark_processing_twice_is_conflict() {
        let m = manager().await;
        let item = m.add(json!({}), 1).await.unwrap();
        m.mark_processing(&item.id).await.unwrap();
        let err = m.mark_processing(&item.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn stats_counts_by_status() {
        let m = manager().await;
        m.add(json!({}), 1).await.unwrap();
        m.add(json!({}), 2).await.unwrap();
        let stats = m.stats().await.unwrap();
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.counts.get("pending"), Some(&2));
    }
}
