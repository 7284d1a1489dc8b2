//! HTTP route handlers (§6). Thin: each handler parses its input, calls into
//! a manager or `dispatch::execute`, and wraps the result with
//! `success_response`/`error_response`. No business logic lives here.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Bytes, Extension, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::registry::REGISTRY;

use super::dispatch;
use super::middleware::{error_response, success_response, RequestId};
use super::state::AppState;

fn to_response(state: &AppState, rid: &str, result: Result<Value, AppError>) -> Response {
    match result {
        Ok(value) => success_response(value),
        Err(err) => error_response(&err, rid, state.config.production),
    }
}

/// `GET /` — service metadata and an endpoint map, for humans poking at the
/// gateway with curl before wiring up a real client.
pub async fn root() -> Json<Value> {
    Json(json!({
        "name": "mcp-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": ["tools", "sessions", "batches", "queue", "templates", "webhooks", "events"],
        "endpoints": {
            "health": "/health",
            "ready": "/ready",
            "tools": "/mcp/tools",
            "execute": "/mcp/execute",
            "sessionsActive": "/api/sessions/active",
            "sessionsStats": "/api/sessions/stats",
            "sessionTimeline": "/api/sessions/{id}/timeline",
            "sessionEvents": "/api/sessions/{id}/events",
            "webhooks": "/webhooks/{provider}",
        }
    }))
}

/// `GET /health`, `GET /api/v1/health` — liveness plus dependency summary.
pub async fn health(State(state): State<AppState>) -> Response {
    let report = state.health.get_health_report().await;
    let status = if report.is_healthy() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(report)).into_response()
}

/// `GET /ready` — readiness is just "is the store reachable", a cheaper
/// check than the full health report.
pub async fn ready(State(state): State<AppState>) -> Response {
    match state.persistence.health_check().await {
        Ok(()) => (StatusCode::OK, Json(json!({"ready": true}))).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"ready": false, "reason": e.to_string()}))).into_response(),
    }
}

/// `GET /mcp/tools` — the static tool catalog.
pub async fn list_tools() -> Json<Value> {
    Json(json!({ "tools": REGISTRY.catalog() }))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExecuteRequest {
    Canonical { tool: String, parameters: Option<Value> },
    Legacy { name: String, arguments: Option<Value> },
}

impl ExecuteRequest {
    fn into_parts(self) -> (String, Option<Value>) {
        match self {
            ExecuteRequest::Canonical { tool, parameters } => (tool, parameters),
            ExecuteRequest::Legacy { name, arguments } => (name, arguments),
        }
    }
}

/// `POST /mcp/execute` — accepts either `{tool, parameters}` or the legacy
/// `{name, arguments}` shape and normalizes before dispatch.
pub async fn execute(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Json(body): Json<ExecuteRequest>,
) -> Response {
    let (tool, parameters) = body.into_parts();
    let result = dispatch::execute(&state, &tool, parameters).await;
    to_response(&state, &rid.0, result)
}

/// `GET /api/sessions/active` — current non-terminal sessions.
pub async fn sessions_active(State(state): State<AppState>, Extension(rid): Extension<RequestId>) -> Response {
    let result = async {
        let ids = state.sessions.active_ids().await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            sessions.push(state.sessions.get(&id).await?);
        }
        serde_json::to_value(sessions).map_err(|e| AppError::Internal(e.into()))
    }
    .await;
    to_response(&state, &rid.0, result)
}

/// `GET /api/sessions/stats` — aggregate counters, grouped by state.
pub async fn sessions_stats(State(state): State<AppState>, Extension(rid): Extension<RequestId>) -> Response {
    let result = async {
        let snapshot = state.sessions.monitor_all().await?;
        serde_json::to_value(snapshot).map_err(|e| AppError::Internal(e.into()))
    }
    .await;
    to_response(&state, &rid.0, result)
}

/// `GET /api/sessions/{id}/timeline` — newest-first activities with
/// inter-event durations.
pub async fn session_timeline(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<String>,
) -> Response {
    let result = async {
        let timeline = state.sessions.timeline(&id).await?;
        serde_json::to_value(timeline).map_err(|e| AppError::Internal(e.into()))
    }
    .await;
    to_response(&state, &rid.0, result)
}

/// `POST /webhooks/{provider}` — HMAC-signed payload. Uses the `Bytes`
/// extractor directly so the signature is verified over the exact bytes the
/// client sent, not a re-serialization of the parsed JSON.
pub async fn webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("x-webhook-signature")
        .or_else(|| headers.get("x-hub-signature-256"))
        .and_then(|v| v.to_str().ok());

    if let Err(err) = state.webhooks.verify_signature(&body, signature) {
        return error_response(&err, "", state.config.production);
    }

    match state.webhooks.handle(&provider, &body).await {
        Ok(_outcome) => Json(json!({"received": true})).into_response(),
        Err(err) => error_response(&err, "", state.config.production),
    }
}

/// `GET /api/sessions/{id}/events` — server-pushed events over SSE. Filters
/// the process-wide bus down to events naming this session (or carrying no
/// session id at all, i.e. process-level events like the heartbeat).
pub async fn session_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.notify.subscribe().await;
    let receiver = subscription.receiver;

    let stream = stream::unfold((receiver, id), move |(mut receiver, id)| async move {
        loop {
            let event = receiver.recv().await?;
            let matches = event
                .payload
                .get("sessionId")
                .and_then(Value::as_str)
                .map(|sid| sid == id)
                .unwrap_or(true);
            if !matches {
                continue;
            }
            let sse_event = SseEvent::default().event(event.kind.clone()).json_data(&*event).unwrap_or_else(|_| SseEvent::default());
            return Some((Ok(sse_event), (receiver, id)));
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
