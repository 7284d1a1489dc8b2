//! The tool catalog: a compile-time enumeration of every tool the gateway
//! exposes, plus the metadata the `/mcp/tools` endpoint serves.
//!
//! §9 redesign flag: the source dispatched by a dynamic string-keyed closure
//! map. Here dispatch is a tagged-variant match (see `gateway::dispatch`) —
//! the registry below only owns lookup and catalog metadata, not handlers.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;

use crate::validator::is_valid_tool_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
    Object,
    Array,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<&'static str>,
}

const fn req(name: &'static str, kind: ParamKind, description: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        kind,
        required: true,
        description,
        default: None,
    }
}

const fn opt(name: &'static str, kind: ParamKind, description: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        kind,
        required: false,
        description,
        default: None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
}

/// Every tool the gateway can dispatch. Adding a variant here and to
/// `CATALOG` is the only change needed to expose a new tool name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    SessionCreate,
    SessionGet,
    SessionList,
    SessionSendMessage,
    SessionApprovePlan,
    SessionCancel,
    SessionDelete,
    SessionGetActivities,
    SessionGetDiff,
    SessionClone,
    SessionRetry,
    SessionSearch,
    SessionMonitorAll,
    SessionTimeline,
    BatchCreate,
    BatchGetStatus,
    BatchApproveAll,
    BatchRetryFailed,
    BatchList,
    QueueAdd,
    QueueGetNext,
    QueueList,
    QueueStats,
    QueueClear,
    TemplateCreate,
    TemplateList,
    TemplateGet,
    TemplateDelete,
    TemplateCreateFromTemplate,
}

impl Tool {
    pub fn name(&self) -> &'static str {
        match self {
            Tool::SessionCreate => "session_create",
            Tool::SessionGet => "session_get",
            Tool::SessionList => "session_list",
            Tool::SessionSendMessage => "session_send_message",
            Tool::SessionApprovePlan => "session_approve_plan",
            Tool::SessionCancel => "session_cancel",
            Tool::SessionDelete => "session_delete",
            Tool::SessionGetActivities => "session_get_activities",
            Tool::SessionGetDiff => "session_get_diff",
            Tool::SessionClone => "session_clone",
            Tool::SessionRetry => "session_retry",
            Tool::SessionSearch => "session_search",
            Tool::SessionMonitorAll => "session_monitor_all",
            Tool::SessionTimeline => "session_timeline",
            Tool::BatchCreate => "batch_create",
            Tool::BatchGetStatus => "batch_get_status",
            Tool::BatchApproveAll => "batch_approve_all",
            Tool::BatchRetryFailed => "batch_retry_failed",
            Tool::BatchList => "batch_list",
            Tool::QueueAdd => "queue_add",
            Tool::QueueGetNext => "queue_get_next",
            Tool::QueueList => "queue_list",
            Tool::QueueStats => "queue_stats",
            Tool::QueueClear => "queue_clear",
            Tool::TemplateCreate => "template_create",
            Tool::TemplateList => "template_list",
            Tool::TemplateGet => "template_get",
            Tool::TemplateDelete => "template_delete",
            Tool::TemplateCreateFromTemplate => "template_create_from_template",
        }
    }
}

const ALL_TOOLS: &[Tool] = &[
    Tool::SessionCreate,
    Tool::SessionGet,
    Tool::SessionList,
    Tool::SessionSendMessage,
    Tool::SessionApprovePlan,
    Tool::SessionCancel,
    Tool::SessionDelete,
    Tool::SessionGetActivities,
    Tool::SessionGetDiff,
    Tool::SessionClone,
    Tool::SessionRetry,
    Tool::SessionSearch,
    Tool::SessionMonitorAll,
    Tool::SessionTimeline,
    Tool::BatchCreate,
    Tool::BatchGetStatus,
    Tool::BatchApproveAll,
    Tool::BatchRetryFailed,
    Tool::BatchList,
    Tool::QueueAdd,
    Tool::QueueGetNext,
    Tool::QueueList,
    Tool::QueueStats,
    Tool::QueueClear,
    Tool::TemplateCreate,
    Tool::TemplateList,
    Tool::TemplateGet,
    Tool::TemplateDelete,
    Tool::TemplateCreateFromTemplate,
];

fn descriptor_for(tool: Tool) -> ToolDescriptor {
    use ParamKind::*;
    let (description, params): (&'static str, Vec<ParamSpec>) = match tool {
        Tool::SessionCreate => (
            "Create a new coding session against the upstream provider.",
            vec![
                req("prompt", String, "Task prompt, 10-10000 characters"),
                req("source", String, "sources/<provider>/<owner>/<repo>"),
                opt("branch", String, "Branch to work on; resolved via upstream if omitted"),
                opt("title", String, "Human-readable title, max 200 chars"),
                opt("requirePlanApproval", Boolean, "Require human plan approval before executing"),
                opt("automationMode", String, "AUTO_CREATE_PR or NONE"),
            ],
        ),
        Tool::SessionGet => ("Fetch a session by id.", vec![req("id", String, "Session id")]),
        Tool::SessionList => (
            "List sessions, optionally filtered by state.",
            vec![opt("state", String, "Status filter, e.g. \"running\"")],
        ),
        Tool::SessionSendMessage => (
            "Send a follow-up message to an existing session.",
            vec![
                req("id", String, "Session id"),
                req("message", String, "Message content"),
            ],
        ),
        Tool::SessionApprovePlan => (
            "Approve the pending plan for a session awaiting approval.",
            vec![req("id", String, "Session id")],
        ),
        Tool::SessionCancel => (
            "Cancel a session.",
            vec![req("id", String, "Session id")],
        ),
        Tool::SessionDelete => (
            "Delete a terminal session record.",
            vec![req("id", String, "Session id")],
        ),
        Tool::SessionGetActivities => (
            "Fetch the append-only activity log for a session.",
            vec![req("id", String, "Session id")],
        ),
        Tool::SessionGetDiff => (
            "Fetch the current diff for a session's working branch.",
            vec![req("id", String, "Session id")],
        ),
        Tool::SessionClone => (
            "Clone a session's configuration into a new session.",
            vec![
                req("id", String, "Source session id"),
                opt("promptOverride", String, "Replacement prompt"),
                opt("titleOverride", String, "Replacement title"),
            ],
        ),
        Tool::SessionRetry => (
            "Create a new session that retries a failed one.",
            vec![
                req("id", String, "Source session id"),
                opt("promptOverride", String, "Replacement prompt"),
            ],
        ),
        Tool::SessionSearch => (
            "Search sessions by title, prompt, or state.",
            vec![
                opt("query", String, "Substring to search title/prompt for"),
                opt("state", String, "Status filter"),
                opt("limit", Integer, "Maximum results"),
            ],
        ),
        Tool::SessionMonitorAll => (
            "Return an aggregate snapshot of all sessions by state.",
            vec![],
        ),
        Tool::SessionTimeline => (
            "Return a session's activities newest-first with inter-event durations.",
            vec![req("id", String, "Session id")],
        ),
        Tool::BatchCreate => (
            "Create a batch of sessions under a bounded concurrency budget.",
            vec![
                req("tasks", Array, "Array of session configs"),
                opt("parallel", Integer, "Concurrency cap, coerced into [1, HARD_CAP]"),
            ],
        ),
        Tool::BatchGetStatus => (
            "Fetch a batch's status and member snapshots.",
            vec![req("id", String, "Batch id")],
        ),
        Tool::BatchApproveAll => (
            "Approve the plan for every awaiting-approval member of a batch.",
            vec![req("id", String, "Batch id")],
        ),
        Tool::BatchRetryFailed => (
            "Retry every currently-failed member of a batch once.",
            vec![req("id", String, "Batch id")],
        ),
        Tool::BatchList => ("List all batches.", vec![]),
        Tool::QueueAdd => (
            "Admit a deferred session-creation request into the priority queue.",
            vec![
                req("config", Object, "Session config"),
                req("priority", Integer, "Lower value = higher priority"),
            ],
        ),
        Tool::QueueGetNext => (
            "Return the highest-priority pending queue item without draining it.",
            vec![],
        ),
        Tool::QueueList => ("List all queue items.", vec![]),
        Tool::QueueStats => ("Return queue depth and status counters.", vec![]),
        Tool::QueueClear => ("Remove all pending queue items.", vec![]),
        Tool::TemplateCreate => (
            "Create a named reusable session template.",
            vec![
                req("name", String, "Unique template name, max 100 chars"),
                opt("description", String, "Template description"),
                req("config", Object, "Partial session config"),
            ],
        ),
        Tool::TemplateList => ("List all templates.", vec![]),
        Tool::TemplateGet => (
            "Fetch a template by name.",
            vec![req("name", String, "Template name")],
        ),
        Tool::TemplateDelete => (
            "Delete a template by name.",
            vec![req("name", String, "Template name")],
        ),
        Tool::TemplateCreateFromTemplate => (
            "Create a session from a stored template, with optional overrides.",
            vec![
                req("name", String, "Template name"),
                opt("overrides", Object, "Fields to merge over the stored config"),
            ],
        ),
    };
    ToolDescriptor {
        name: tool.name(),
        description,
        params,
    }
}

/// The full catalog, in registration order, and a name -> descriptor index
/// built once at startup for O(1) lookup.
pub struct Registry {
    catalog: Vec<ToolDescriptor>,
    index: HashMap<&'static str, Tool>,
}

impl Registry {
    fn build() -> Self {
        let catalog: Vec<ToolDescriptor> = ALL_TOOLS.iter().copied().map(descriptor_for).collect();
        let index = ALL_TOOLS.iter().map(|t| (t.name(), *t)).collect();
        for t in ALL_TOOLS {
            debug_assert!(is_valid_tool_name(t.name()), "tool name must match the registry pattern");
        }
        Self { catalog, index }
    }

    pub fn lookup(&self, name: &str) -> Option<Tool> {
        self.index.get(name).copied()
    }

    pub fn catalog(&self) -> &[ToolDescriptor] {
        &self.catalog
    }
}

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::build);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_registered_tool_name_is_valid() {
        for t in ALL_TOOLS {
            assert!(is_valid_tool_name(t.name()), "{}", t.name());
        }
    }

    #[test]
    fn lookup_is_consistent_with_catalog_order() {
        let registry = &*REGISTRY;
        assert_eq!(registry.catalog().len(), ALL_TOOLS.len());
        assert_eq!(registry.catalog()[0].name, Tool::SessionCreate.name());
        assert_eq!(registry.lookup("session_create"), Some(Tool::SessionCreate));
        assert_eq!(registry.lookup("nope"), None);
    }

    #[test]
    fn names_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for t in ALL_TOOLS {
            assert!(seen.insert(t.name()), "duplicate tool name {}", t.name());
        }
    }
}
