//! Shared application state handed to every axum handler via `.with_state`.

use std::sync::Arc;

use crate::batch::BatchManager;
use crate::config::Config;
use crate::health::HealthReporter;
use crate::notify::NotificationBus;
use crate::persistence::Persistence;
use crate::queue::QueueManager;
use crate::session::SessionManager;
use crate::task_queue::TaskQueueManager;
use crate::templates::TemplateManager;
use crate::upstream::UpstreamClient;
use crate::webhook::WebhookReceiver;

use super::middleware::RateLimiter;

/// Cheaply cloneable: every field is itself an `Arc`-backed handle or a
/// cheap-to-clone manager, matching the teacher's `Arc<AppContext>` idiom
/// (here the `Arc` wrapping happens per-field instead of around the whole
/// struct, since each manager already shares its state internally).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: SessionManager,
    pub batches: BatchManager,
    pub queue: QueueManager,
    pub templates: TemplateManager,
    pub task_queue: TaskQueueManager,
    pub webhooks: Arc<WebhookReceiver>,
    pub notify: NotificationBus,
    pub health: Arc<HealthReporter>,
    pub persistence: Persistence,
    pub rate_limiter: Arc<RateLimiter>,
    pub upstream: UpstreamClient,
}

impl AppState {
    /// The shared upstream conduit, for collaborators outside the HTTP
    /// handler tree (the scheduler's cache-expiry loop) that need it without
    /// threading it through a manager that merely happens to hold one.
    pub fn sessions_upstream(&self) -> UpstreamClient {
        self.upstream.clone()
    }
}
