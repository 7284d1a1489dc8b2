//! In-memory fallback profile (§4.10), selected when no persistence URL is
//! configured. Same record shapes as the SQLite profile; one mutex guards
//! every table so cross-table operations (e.g. the webhook dedup claim)
//! stay atomic without a transaction.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{
    ActionLogEntry, Activity, BatchRecord, IngestTaskRecord, QueueItemRecord, SessionRecord, TemplateRecord,
    WebhookEventEntry,
};

#[derive(Default)]
struct Tables {
    sessions: Vec<SessionRecord>,
    activities: HashMap<String, Vec<Activity>>,
    templates: Vec<TemplateRecord>,
    queue_items: Vec<QueueItemRecord>,
    batches: Vec<BatchRecord>,
    deploy_remediations: HashMap<(String, String), (String, String)>,
    action_log: Vec<ActionLogEntry>,
    webhook_events: Vec<WebhookEventEntry>,
    ingest_tasks: Vec<IngestTaskRecord>,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_session(&self, record: SessionRecord) {
        let mut t = self.lock();
        t.sessions.retain(|s| s.id != record.id);
        t.sessions.push(record);
    }

    pub fn get_session(&self, id: &str) -> Option<SessionRecord> {
        self.lock().sessions.iter().find(|s| s.id == id).cloned()
    }

    pub fn list_sessions(&self) -> Vec<SessionRecord> {
        self.lock().sessions.clone()
    }

    pub fn update_session(&self, record: SessionRecord) {
        let mut t = self.lock();
        match t.sessions.iter_mut().find(|s| s.id == record.id) {
            Some(slot) => *slot = record,
            None => t.sessions.push(record),
        }
    }

    pub fn delete_session(&self, id: &str) {
        let mut t = self.lock();
        t.sessions.retain(|s| s.id != id);
        t.activities.remove(id);
    }

    pub fn append_activity(&self, session_id: &str, activity: Activity) {
        self.lock().activities.entry(session_id.to_string()).or_default().push(activity);
    }

    pub fn list_activities(&self, session_id: &str) -> Vec<Activity> {
        self.lock().activities.get(session_id).cloned().unwrap_or_default()
    }

    pub fn insert_template(&self, record: TemplateRecord) -> bool {
        let mut t = self.lock();
        if t.templates.iter().any(|r| r.name == record.name) {
            return false;
        }
        t.templates.push(record);
        true
    }

    pub fn get_template(&self, name: &str) -> Option<TemplateRecord> {
        self.lock().templates.iter().find(|r| r.name == name).cloned()
    }

    pub fn list_templates(&self) -> Vec<TemplateRecord> {
        self.lock().templates.clone()
    }

    pub fn delete_template(&self, name: &str) -> bool {
        let mut t = self.lock();
        let before = t.templates.len();
        t.templates.retain(|r| r.name != name);
        t.templates.len() != before
    }

    pub fn increment_template_usage(&self, name: &str) {
        let mut t = self.lock();
        if let Some(r) = t.templates.iter_mut().find(|r| r.name == name) {
            r.usage_count += 1;
        }
    }

    pub fn count_templates(&self) -> i64 {
        self.lock().templates.len() as i64
    }

    pub fn insert_queue_item(&self, record: QueueItemRecord) {
        self.lock().queue_items.push(record);
    }

    pub fn get_queue_item(&self, id: &str) -> Option<QueueItemRecord> {
        self.lock().queue_items.iter().find(|r| r.id == id).cloned()
    }

    pub fn update_queue_item(&self, record: QueueItemRecord) {
        let mut t = self.lock();
        if let Some(slot) = t.queue_items.iter_mut().find(|r| r.id == record.id) {
            *slot = record;
        }
    }

    pub fn list_queue_items(&self) -> Vec<QueueItemRecord> {
        self.lock().queue_items.clone()
    }

    pub fn delete_queue_item(&self, id: &str) {
        self.lock().queue_items.retain(|r| r.id != id);
    }

    pub fn clear_pending_queue_items(&self) -> u64 {
        let mut t = self.lock();
        let before = t.queue_items.len();
        t.queue_items.retain(|r| r.status != "pending");
        (before - t.queue_items.len()) as u64
    }

    /// Evicts the oldest terminal items beyond `keep`, ordered by `added_at`.
    pub fn prune_terminal_queue_items(&self, keep: usize) -> u64 {
        let mut t = self.lock();
        let mut terminal_idx: Vec<usize> = t
            .queue_items
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == "completed" || r.status == "failed")
            .map(|(i, _)| i)
            .collect();
        if terminal_idx.len() <= keep {
            return 0;
        }
        terminal_idx.sort_by(|&a, &b| t.queue_items[a].added_at.cmp(&t.queue_items[b].added_at));
        let excess = terminal_idx.len() - keep;
        let to_remove: HashSet<usize> = terminal_idx.into_iter().take(excess).collect();
        let mut i = 0usize;
        let mut removed = 0u64;
        t.queue_items.retain(|_| {
            let keep_this = !to_remove.contains(&i);
            i += 1;
            if !keep_this {
                removed += 1;
            }
            keep_this
        });
        removed
    }

    pub fn insert_batch(&self, record: BatchRecord) {
        self.lock().batches.push(record);
    }

    pub fn get_batch(&self, id: &str) -> Option<BatchRecord> {
        self.lock().batches.iter().find(|b| b.id == id).cloned()
    }

    pub fn list_batches(&self) -> Vec<BatchRecord> {
        self.lock().batches.clone()
    }

    pub fn update_batch_members(&self, id: &str, members: Vec<String>) {
        let mut t = self.lock();
        if let Some(b) = t.batches.iter_mut().find(|b| b.id == id) {
            b.members = members;
        }
    }

    /// Atomically claims the `(service_id, deploy_id)` pair. Returns `true`
    /// if this call performed the claim, `false` if it was already claimed.
    pub fn try_claim_remediation(&self, service_id: &str, deploy_id: &str, session_id: &str, now: &str) -> bool {
        let mut t = self.lock();
        let key = (service_id.to_string(), deploy_id.to_string());
        if t.deploy_remediations.contains_key(&key) {
            return false;
        }
        t.deploy_remediations.insert(key, (session_id.to_string(), now.to_string()));
        true
    }

    pub fn set_remediation_session(&self, service_id: &str, deploy_id: &str, session_id: &str) {
        let mut t = self.lock();
        let key = (service_id.to_string(), deploy_id.to_string());
        if let Some(entry) = t.deploy_remediations.get_mut(&key) {
            entry.0 = session_id.to_string();
        }
    }

    pub fn reap_remediations_older_than(&self, cutoff: &str) -> u64 {
        let mut t = self.lock();
        let before = t.deploy_remediations.len();
        t.deploy_remediations.retain(|_, (_, created_at)| created_at.as_str() >= cutoff);
        (before - t.deploy_remediations.len()) as u64
    }

    pub fn log_action(&self, entry: ActionLogEntry) {
        self.lock().action_log.push(entry);
    }

    pub fn list_action_log(&self) -> Vec<ActionLogEntry> {
        self.lock().action_log.clone()
    }

    pub fn record_webhook_event(&self, entry: WebhookEventEntry) {
        self.lock().webhook_events.push(entry);
    }

    pub fn insert_ingest_task(&self, record: IngestTaskRecord) {
        self.lock().ingest_tasks.push(record);
    }

    pub fn update_ingest_task(&self, record: &IngestTaskRecord) {
        let mut t = self.lock();
        if let Some(slot) = t.ingest_tasks.iter_mut().find(|r| r.id == record.id) {
            *slot = record.clone();
        }
    }

    pub fn list_ingest_tasks(&self) -> Vec<IngestTaskRecord> {
        let mut tasks = self.lock().ingest_tasks.clone();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            status: "pending".to_string(),
            config: json!({}),
            plan: None,
            result: None,
            pr_url: None,
            created_at: "t0".to_string(),
            updated_at: "t0".to_string(),
        }
    }

    #[test]
    fn insert_then_update_preserves_single_row() {
        let store = MemoryStore::new();
        store.insert_session(session("s1"));
        let mut updated = session("s1");
        updated.status = "planning".to_string();
        store.update_session(updated);
        assert_eq!(store.list_sessions().len(), 1);
        assert_eq!(store.get_session("s1").unwrap().status, "planning");
    }

    #[test]
    fn remediation_claim_is_exclusive() {
        let store = MemoryStore::new();
        assert!(store.try_claim_remediation("svc", "d1", "sess-a", "t0"));
        assert!(!store.try_claim_remediation("svc", "d1", "sess-b", "t1"));
    }

    #[test]
    fn prune_terminal_queue_items_keeps_newest() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.insert_queue_item(QueueItemRecord {
                id: format!("q{i}"),
                config: json!({}),
                priority: 1,
                status: "completed".to_string(),
                added_at: format!("t{i}"),
                session_id: None,
                completed_at: None,
                error: None,
            });
        }
        let removed = store.prune_terminal_queue_items(2);
        assert_eq!(removed, 3);
        assert_eq!(store.list_queue_items().len(), 2);
    }

    #[test]
    fn ingest_task_update_replaces_in_place() {
        let store = MemoryStore::new();
        let task = IngestTaskRecord {
            id: "t1".to_string(),
            source_ref: "repo#42".to_string(),
            config: json!({}),
            status: "pending".to_string(),
            retry_count: 0,
            max_retries: 3,
            next_attempt_at: "t0".to_string(),
            session_id: None,
            error: None,
            created_at: "t0".to_string(),
            updated_at: "t0".to_string(),
        };
        store.insert_ingest_task(task.clone());
        let mut retried = task.clone();
        retried.retry_count = 1;
        retried.status = "processing".to_string();
        store.update_ingest_task(&retried);
        let tasks = store.list_ingest_tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].retry_count, 1);
        assert_eq!(tasks[0].status, "processing");
    }
}
