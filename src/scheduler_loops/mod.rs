//! Background timer loops (§2 component 14, §5).
//!
//! Everything here is a `tokio::spawn`ed loop over an `interval`, grounded on
//! the teacher's `main.rs` background-task-spawning pattern (the DB
//! prune/vacuum task) and `storage::prune_old_sessions`/`vacuum`. Each loop
//! owns cheaply-cloneable handles, never a lock held across a suspension
//! point, matching §5's concurrency model.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{info, warn};

use crate::batch::BatchManager;
use crate::gateway::state::AppState;
use crate::queue::QueueManager;
use crate::session::SessionManager;
use crate::task_queue::TaskQueueManager;
use crate::upstream::UpstreamClient;
use crate::webhook::WebhookReceiver;

/// Poll interval for the session monitoring loop (§4.3's default `P`).
const MONITOR_POLL_SECS: u64 = 5;
/// Max attempts before a stuck session is swept to `failed` (§4.3's `M`, and
/// `M * P` = the §5 soft long-poll deadline of 5 minutes).
const MONITOR_MAX_ATTEMPTS: u32 = 60;

const BATCH_TICK_SECS: u64 = 2;
const QUEUE_DRAIN_SECS: u64 = 1;
const TASK_QUEUE_TICK_SECS: u64 = 5;
const WEBHOOK_REAP_SECS: u64 = 60 * 60;
const CACHE_EXPIRY_SECS: u64 = 30;

/// Spawns every background loop the gateway needs and returns their join
/// handles. Callers keep the handles alive for the process lifetime;
/// `lib.rs`/`main.rs` does not await them except at shutdown.
pub fn spawn_all(state: AppState) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        spawn_session_monitor(state.sessions.clone()),
        spawn_batch_ticker(state.batches.clone(), state.sessions.clone()),
        spawn_queue_drainer(state.queue.clone(), state.sessions.clone()),
        spawn_task_queue_ticker(state.task_queue.clone(), state.sessions.clone()),
        spawn_webhook_reaper(state.webhooks.clone()),
        spawn_cache_expiry(state.sessions_upstream()),
    ]
}

/// Tracks, per session id, how many consecutive polls found no state change
/// and what `updated_at` last looked like. Reset whenever a poll observes a
/// different `updated_at`; once a session racks up `MONITOR_MAX_ATTEMPTS`
/// stalled polls it is swept to `failed` per §5's soft long-poll deadline.
struct MonitorState {
    last_updated_at: String,
    stalled_polls: u32,
}

/// The session monitoring loop: every `P` seconds, poll each non-terminal
/// session once (an independent upstream call subject to the Upstream
/// Client's own retry/circuit rules) and stop tracking it once it reaches
/// `awaiting_approval` or a terminal state. A session that makes no forward
/// progress for `M` consecutive polls is force-failed with reason `timeout`.
fn spawn_session_monitor(sessions: SessionManager) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(MONITOR_POLL_SECS));
        let mut tracked: HashMap<String, MonitorState> = HashMap::new();
        loop {
            ticker.tick().await;

            let active_ids = match sessions.active_ids().await {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(error = %err, "session monitor: failed to list active sessions");
                    continue;
                }
            };
            let active: std::collections::HashSet<String> = active_ids.iter().cloned().collect();
            tracked.retain(|id, _| active.contains(id));

            for id in active_ids {
                let session = match sessions.sync_from_upstream(&id).await {
                    Ok(session) => session,
                    Err(err) => {
                        warn!(session_id = %id, error = %err, "session monitor: poll failed");
                        continue;
                    }
                };

                if session.status.is_terminal() || session.status == crate::session::SessionStatus::AwaitingApproval {
                    tracked.remove(&id);
                    continue;
                }

                let entry = tracked.entry(id.clone()).or_insert_with(|| MonitorState {
                    last_updated_at: session.updated_at.clone(),
                    stalled_polls: 0,
                });

                if entry.last_updated_at == session.updated_at {
                    entry.stalled_polls += 1;
                } else {
                    entry.last_updated_at = session.updated_at.clone();
                    entry.stalled_polls = 0;
                }

                if entry.stalled_polls >= MONITOR_MAX_ATTEMPTS {
                    match sessions.fail_timeout(&id).await {
                        Ok(true) => info!(session_id = %id, "session monitor: swept stuck session to failed/timeout"),
                        Ok(false) => {}
                        Err(err) => warn!(session_id = %id, error = %err, "session monitor: failed to sweep stuck session"),
                    }
                    tracked.remove(&id);
                }
            }
        }
    })
}

/// Drives `BatchManager::tick_all`, admitting the next queued task in every
/// batch that has spare concurrency under its `parallel` cap (§4.5).
fn spawn_batch_ticker(batches: BatchManager, sessions: SessionManager) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(BATCH_TICK_SECS));
        loop {
            ticker.tick().await;
            if let Err(err) = batches.tick_all(&sessions).await {
                warn!(error = %err, "batch ticker: tick_all failed");
            }
        }
    })
}

/// Drains the priority queue: one `getNext`-create-record cycle per tick,
/// via `QueueManager::process_queue`'s atomic claim-before-call (§4.6).
fn spawn_queue_drainer(queue: QueueManager, sessions: SessionManager) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(QUEUE_DRAIN_SECS));
        loop {
            ticker.tick().await;
            if let Err(err) = queue.process_queue(&sessions).await {
                warn!(error = %err, "queue drainer: process_queue failed");
            }
        }
    })
}

/// Drives the external task-ingest queue's retry-with-backoff loop (§4.12).
fn spawn_task_queue_ticker(task_queue: TaskQueueManager, sessions: SessionManager) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(TASK_QUEUE_TICK_SECS));
        loop {
            ticker.tick().await;
            match task_queue.tick(&sessions).await {
                Ok(n) if n > 0 => info!(materialized = n, "task queue: materialized ingest tasks into sessions"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "task queue ticker: tick failed"),
            }
        }
    })
}

/// Evicts deploy→session remediation mappings older than the configured
/// retention (§4.8's cleanup reaper). Runs hourly; the mappings themselves
/// carry a multi-hour default retention so an hourly cadence is frequent
/// enough without needless churn.
fn spawn_webhook_reaper(webhooks: std::sync::Arc<WebhookReceiver>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(WEBHOOK_REAP_SECS));
        loop {
            ticker.tick().await;
            match webhooks.reap_expired().await {
                Ok(n) if n > 0 => info!(reaped = n, "webhook reaper: evicted expired deploy remediation mappings"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "webhook reaper: reap_expired failed"),
            }
        }
    })
}

/// Actively purges expired response-cache entries rather than waiting for a
/// `get` to lazily discover them, bounding memory for keys that go cold.
fn spawn_cache_expiry(upstream: UpstreamClient) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(CACHE_EXPIRY_SECS));
        loop {
            ticker.tick().await;
            let purged = upstream.cache().purge_expired().await;
            if purged > 0 {
                info!(purged, "cache expiry: purged stale upstream response cache entries");
            }
        }
    })
}
