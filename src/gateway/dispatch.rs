//! Tool dispatch (§4.2): validates a `(tool, parameters)` envelope against
//! the registry, then routes it to the owning manager. Each arm deserializes
//! its own small parameter shape directly into the manager's existing
//! domain types rather than threading a generic "validate then invoke"
//! indirection through a closure table — the registry only owns lookup and
//! catalog metadata (see `registry::mod`).

use std::time::Instant;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::persistence::ActionLogEntry;
use crate::registry::{Tool, REGISTRY};
use crate::session::{ListFilter, SearchFilter, SessionConfig};

use super::state::AppState;

fn params(value: Option<Value>) -> Value {
    value.unwrap_or_else(|| json!({}))
}

fn parse<T: for<'de> Deserialize<'de>>(value: Value) -> AppResult<T> {
    serde_json::from_value(value).map_err(|e| AppError::Validation(format!("invalid parameters: {e}")))
}

#[derive(Debug, Deserialize)]
struct IdParam {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SendMessageParams {
    id: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CloneParams {
    id: String,
    #[serde(rename = "promptOverride")]
    prompt_override: Option<String>,
    #[serde(rename = "titleOverride")]
    title_override: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RetryParams {
    id: String,
    #[serde(rename = "promptOverride")]
    prompt_override: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchCreateParams {
    tasks: Vec<SessionConfig>,
    parallel: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct QueueAddParams {
    config: Value,
    priority: i64,
}

#[derive(Debug, Deserialize)]
struct TemplateCreateParams {
    name: String,
    description: Option<String>,
    config: Value,
}

#[derive(Debug, Deserialize)]
struct TemplateNameParams {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TemplateFromTemplateParams {
    name: String,
    overrides: Option<Value>,
}

/// Validates the tool name against the registry, dispatches, and records an
/// immutable audit entry for the attempt (§3's "Action log entry", §7's
/// "Activity-log writes for user-visible failures are best-effort" — a
/// logging failure here is itself logged and never shadows the real result).
pub async fn execute(state: &AppState, tool_name: &str, parameters: Option<Value>) -> AppResult<Value> {
    let started = Instant::now();
    let config_snapshot = parameters.clone();
    let result = dispatch(state, tool_name, parameters).await;
    let duration_ms = started.elapsed().as_millis() as i64;

    let entry = ActionLogEntry {
        id: Uuid::new_v4().to_string(),
        workflow_instance: None,
        action_type: tool_name.to_string(),
        config: config_snapshot,
        result: result.as_ref().ok().cloned(),
        success: result.is_ok(),
        error: result.as_ref().err().map(|e| e.to_string()),
        duration_ms,
        timestamp: Utc::now().to_rfc3339(),
    };
    if let Err(err) = state.persistence.log_action(&entry).await {
        warn!(tool = tool_name, error = %err, "failed to record action log entry");
    }

    result
}

/// Validates the tool name against the registry, then routes to the owning
/// manager. Unknown tool names surface as `AppError::Validation` (rendered
/// 400, per §4.1's "unknown tool -> 400" failure mode, which takes precedence
/// over the generic 404 reserved for unknown *routes*).
async fn dispatch(state: &AppState, tool_name: &str, parameters: Option<Value>) -> AppResult<Value> {
    let tool = REGISTRY
        .lookup(tool_name)
        .ok_or_else(|| AppError::Validation(format!("unknown tool {tool_name:?}")))?;
    let params = params(parameters);

    match tool {
        Tool::SessionCreate => {
            let config: SessionConfig = parse(params)?;
            let session = state.sessions.create(config).await?;
            serde_json::to_value(session).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::SessionGet => {
            let p: IdParam = parse(params)?;
            let session = state.sessions.get(&p.id).await?;
            serde_json::to_value(session).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::SessionList => {
            let filter: ListFilter = parse(params)?;
            let sessions = state.sessions.list(filter).await?;
            serde_json::to_value(sessions).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::SessionSendMessage => {
            let p: SendMessageParams = parse(params)?;
            let session = state.sessions.send_message(&p.id, &p.message).await?;
            serde_json::to_value(session).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::SessionApprovePlan => {
            let p: IdParam = parse(params)?;
            let session = state.sessions.approve_plan(&p.id).await?;
            serde_json::to_value(session).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::SessionCancel => {
            let p: IdParam = parse(params)?;
            let session = state.sessions.cancel(&p.id).await?;
            serde_json::to_value(session).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::SessionDelete => {
            let p: IdParam = parse(params)?;
            state.sessions.delete(&p.id).await?;
            Ok(json!({"id": p.id, "deleted": true}))
        }
        Tool::SessionGetActivities => {
            let p: IdParam = parse(params)?;
            let activities = state.sessions.get_activities(&p.id).await?;
            serde_json::to_value(activities).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::SessionGetDiff => {
            let p: IdParam = parse(params)?;
            let diff = state.sessions.get_diff(&p.id).await?;
            Ok(json!({"diff": diff}))
        }
        Tool::SessionClone => {
            let p: CloneParams = parse(params)?;
            let session = state.sessions.clone_session(&p.id, p.prompt_override, p.title_override).await?;
            serde_json::to_value(session).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::SessionRetry => {
            let p: RetryParams = parse(params)?;
            let session = state.sessions.retry(&p.id, p.prompt_override).await?;
            serde_json::to_value(session).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::SessionSearch => {
            let filter: SearchFilter = parse(params)?;
            let sessions = state.sessions.search(filter).await?;
            serde_json::to_value(sessions).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::SessionMonitorAll => {
            let snapshot = state.sessions.monitor_all().await?;
            serde_json::to_value(snapshot).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::SessionTimeline => {
            let p: IdParam = parse(params)?;
            let timeline = state.sessions.timeline(&p.id).await?;
            serde_json::to_value(timeline).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::BatchCreate => {
            let p: BatchCreateParams = parse(params)?;
            let status = state.batches.create_batch(p.tasks, p.parallel, &state.sessions).await?;
            serde_json::to_value(status).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::BatchGetStatus => {
            let p: IdParam = parse(params)?;
            let status = state.batches.get_batch_status(&p.id, &state.sessions).await?;
            serde_json::to_value(status).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::BatchApproveAll => {
            let p: IdParam = parse(params)?;
            let status = state.batches.approve_all_in_batch(&p.id, &state.sessions).await?;
            serde_json::to_value(status).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::BatchRetryFailed => {
            let p: IdParam = parse(params)?;
            let status = state.batches.retry_failed_in_batch(&p.id, &state.sessions).await?;
            serde_json::to_value(status).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::BatchList => {
            let batches = state.batches.list_batches(&state.sessions).await?;
            serde_json::to_value(batches).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::QueueAdd => {
            let p: QueueAddParams = parse(params)?;
            let item = state.queue.add(p.config, p.priority).await?;
            serde_json::to_value(item).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::QueueGetNext => {
            let item = state.queue.get_next().await?;
            serde_json::to_value(item).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::QueueList => {
            let items = state.queue.list().await?;
            serde_json::to_value(items).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::QueueStats => {
            let stats = state.queue.stats().await?;
            serde_json::to_value(stats).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::QueueClear => {
            let removed = state.queue.clear().await?;
            Ok(json!({"removed": removed}))
        }
        Tool::TemplateCreate => {
            let p: TemplateCreateParams = parse(params)?;
            let template = state.templates.create(p.name, p.description, p.config).await?;
            serde_json::to_value(template).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::TemplateList => {
            let templates = state.templates.list().await?;
            serde_json::to_value(templates).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::TemplateGet => {
            let p: TemplateNameParams = parse(params)?;
            let template = state.templates.get(&p.name).await?;
            serde_json::to_value(template).map_err(|e| AppError::Internal(e.into()))
        }
        Tool::TemplateDelete => {
            let p: TemplateNameParams = parse(params)?;
            state.templates.delete(&p.name).await?;
            Ok(json!({"name": p.name, "deleted": true}))
        }
        Tool::TemplateCreateFromTemplate => {
            let p: TemplateFromTemplateParams = parse(params)?;
            let session = state
                .templates
                .create_from_template(&p.name, p.overrides, &state.sessions)
                .await?;
            serde_json::to_value(session).map_err(|e| AppError::Internal(e.into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_name_is_not_in_registry() {
        assert!(REGISTRY.lookup("not_a_real_tool").is_none());
    }

    #[tokio::test]
    async fn unknown_tool_is_validation_error_and_still_logged() {
        let state = crate::test_support::test_state().await;
        let err = execute(&state, "not_a_real_tool", Some(json!({}))).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let log = state.persistence.list_action_log().await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action_type, "not_a_real_tool");
        assert!(!log[0].success);
        assert!(log[0].error.is_some());
    }

    #[tokio::test]
    async fn successful_call_logs_result_and_duration() {
        let state = crate::test_support::test_state().await;
        execute(&state, "session_monitor_all", None).await.unwrap();

        let log = state.persistence.list_action_log().await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action_type, "session_monitor_all");
        assert!(log[0].success);
        assert!(log[0].duration_ms >= 0);
    }
}
