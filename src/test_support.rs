//! Shared test fixtures for route-level tests. Only compiled under `cfg(test)`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use crate::batch::BatchManager;
use crate::config::{Config, Secrets};
use crate::gateway::middleware::RateLimiter;
use crate::gateway::state::AppState;
use crate::health::checks::{DatabaseHealthCheck, StorageHealthCheck, UpstreamHealthCheck};
use crate::health::HealthReporter;
use crate::notify::NotificationBus;
use crate::persistence::Persistence;
use crate::queue::QueueManager;
use crate::session::SessionManager;
use crate::task_queue::TaskQueueManager;
use crate::templates::TemplateManager;
use crate::upstream::auth::AuthProvider;
use crate::upstream::{UpstreamClient, UpstreamConfig};
use crate::webhook::WebhookReceiver;

/// Builds a fully wired `AppState` backed by the in-memory persistence
/// profile, for exercising the assembled router without a real database or
/// network upstream.
pub async fn test_state() -> AppState {
    let config = Arc::new(Config::default());
    let persistence = Persistence::connect(None, Path::new("/tmp/unused")).await.unwrap();

    let upstream_config = UpstreamConfig {
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
        AuthProvider::from_secrets(
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
    let notify = NotificationBus::new();

    let sessions = SessionManager::new(persistence.clone(), upstream.clone(), notify.clone());
    let batches = BatchManager::new(persistence.clone(), config.batch_hard_cap);
    let queue = QueueManager::new(persistence.clone(), config.queue_max_retained);
    let templates = TemplateManager::new(persistence.clone(), config.template_cap);
    let task_queue = TaskQueueManager::new(persistence.clone());
    let webhooks = Arc::new(WebhookReceiver::new(persistence.clone(), upstream.clone(), sessions.clone(), &config));

    let health = Arc::new(
        HealthReporter::new()
            .with_check(DatabaseHealthCheck::new(persistence.clone()))
            .with_check(StorageHealthCheck::new(&config.data_dir))
            .with_check(UpstreamHealthCheck::new(upstream.breaker().clone())),
    );

    let rate_limiter = Arc::new(RateLimiter::new(
        Duration::from_secs(config.rate_limit_window_secs),
        config.rate_limit_max,
    ));

    AppState {
        config,
        sessions,
        batches,
        queue,
        templates,
        task_queue,
        webhooks,
        notify,
        health,
        persistence,
        rate_limiter,
        upstream,
    }
}
