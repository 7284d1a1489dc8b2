//! Process entry point: load configuration, wire every collaborator exactly
//! once at startup (§9's redesign flag — no ad-hoc global singletons), spawn
//! the background scheduler loops, then serve the HTTP gateway until a
//! shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mcp_gateway::batch::BatchManager;
use mcp_gateway::config::{self, Config, LogFormat};
use mcp_gateway::gateway::{build_router, state::AppState};
use mcp_gateway::gateway::middleware::RateLimiter;
use mcp_gateway::health::checks::{DatabaseHealthCheck, StorageHealthCheck, UpstreamHealthCheck};
use mcp_gateway::health::HealthReporter;
use mcp_gateway::notify::{self, NotificationBus};
use mcp_gateway::persistence::Persistence;
use mcp_gateway::queue::QueueManager;
use mcp_gateway::scheduler_loops;
use mcp_gateway::session::SessionManager;
use mcp_gateway::task_queue::TaskQueueManager;
use mcp_gateway::templates::TemplateManager;
use mcp_gateway::upstream::auth::AuthProvider;
use mcp_gateway::upstream::{UpstreamClient, UpstreamConfig};
use mcp_gateway::webhook::WebhookReceiver;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(config::load_from_env()?);
    let _log_guard = setup_logging(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "mcp-gateway starting");
    info!(
        host = %config.listen_host,
        port = config.listen_port,
        persistence = if config.persistence_url.is_some() { "durable" } else { "in-memory" },
        "config loaded"
    );

    let persistence = Persistence::connect(config.persistence_url.as_deref(), &config.data_dir)
        .await
        .context("connecting to persistence store")?;

    let http = Client::builder()
        .build()
        .context("building upstream HTTP client")?;
    let auth = Arc::new(
        AuthProvider::from_secrets(&config.secrets, http).context("resolving upstream credentials")?,
    );
    let upstream = UpstreamClient::new(UpstreamConfig::from_config(&config), auth)
        .context("constructing upstream client")?;

    let notify = NotificationBus::new();
    let sessions = SessionManager::new(persistence.clone(), upstream.clone(), notify.clone());
    let batches = BatchManager::new(persistence.clone(), config.batch_hard_cap);
    let queue = QueueManager::new(persistence.clone(), config.queue_max_retained);
    let templates = TemplateManager::new(persistence.clone(), config.template_cap);
    let task_queue = TaskQueueManager::new(persistence.clone());
    let webhooks = Arc::new(WebhookReceiver::new(
        persistence.clone(),
        upstream.clone(),
        sessions.clone(),
        &config,
    ));

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

    let state = AppState {
        config: config.clone(),
        sessions,
        batches,
        queue,
        templates,
        task_queue,
        webhooks,
        notify: notify.clone(),
        health,
        persistence,
        rate_limiter,
        upstream,
    };

    // ── Background scheduler loops (§2 component 14) ──────────────────────
    let scheduler_handles = scheduler_loops::spawn_all(state.clone());
    let _heartbeat_handle = notify::spawn_heartbeat(notify, Duration::from_secs(notify::DEFAULT_HEARTBEAT_SECS));

    let app = build_router(state);

    let addr = format!("{}:{}", config.listen_host, config.listen_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serving HTTP gateway")?;

    info!("shutdown signal received, draining background loops");
    for handle in scheduler_handles {
        handle.abort();
    }

    Ok(())
}

/// Resolves on SIGINT (and, on unix, SIGTERM) so the server drains in-flight
/// handlers and exits cleanly rather than being killed mid-response (§5's
/// graceful-shutdown contract).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Structured logging setup (§4.14/ambient stack): `json` or `pretty` format
/// per config, optional rotating file sink alongside stdout. Returns the
/// `WorkerGuard` that must stay alive for the process lifetime when a log
/// file is configured.
fn setup_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let Some(log_file) = &config.log_file else {
        let registry = tracing_subscriber::registry().with(env_filter);
        match config.log_format {
            LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
            LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        }
        return None;
    };

    let dir = log_file.parent().unwrap_or_else(|| std::path::Path::new("."));
    let filename = log_file
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("mcp-gateway.log"));

    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!(
            "warn: could not create log directory '{}': {e} — falling back to stdout",
            dir.display()
        );
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.log_format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
                .init();
        }
        LogFormat::Pretty => {
            registry
                .with(tracing_subscriber::fmt::layer().compact())
                .with(tracing_subscriber::fmt::layer().compact().with_writer(non_blocking))
                .init();
        }
    }

    warn!(path = %log_file.display(), "file logging enabled");
    Some(guard)
}
