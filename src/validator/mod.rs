//! Schema-driven validation for tool envelopes and session configuration.
//!
//! Validation never touches storage or the upstream client — it is pure,
//! synchronous, and runs before a handler is invoked. A failed validation
//! produces a structured issue list rather than a single message, so the
//! gateway's 400 response can point at the exact field that was wrong.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::{AppError, AppResult};

/// A single field-level validation failure.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Issue {
    pub field: String,
    pub message: String,
}

impl Issue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Collects issues across several checks; converts to an [`AppError::Validation`]
/// only if non-empty.
#[derive(Debug, Default)]
pub struct IssueList(Vec<Issue>);

impl IssueList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(Issue::new(field, message));
    }

    pub fn into_result<T>(self, value: T) -> AppResult<T> {
        if self.0.is_empty() {
            Ok(value)
        } else {
            let rendered = self
                .0
                .iter()
                .map(|i| format!("{}: {}", i.field, i.message))
                .collect::<Vec<_>>()
                .join("; ");
            Err(AppError::Validation(rendered))
        }
    }

    pub fn issues(&self) -> &[Issue] {
        &self.0
    }
}

/// Tool names must match `^[A-Za-z_][A-Za-z0-9_]*$` (§3 invariant).
pub static TOOL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

/// `source` must match `sources/<provider>/<owner>/<repo>`, each component
/// non-empty, ≤100 chars, and free of `..` or embedded `/`.
static SOURCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^sources/[A-Za-z0-9_.-]{1,100}/[A-Za-z0-9_.-]{1,100}/[A-Za-z0-9_.-]{1,100}$")
        .expect("static regex")
});

pub fn is_valid_tool_name(name: &str) -> bool {
    TOOL_NAME_RE.is_match(name)
}

/// Validate a session `source` string per §4.3.
pub fn validate_source(source: &str) -> Result<(), String> {
    if source.contains("..") {
        return Err("must not contain \"..\"".to_string());
    }
    if !SOURCE_RE.is_match(source) {
        return Err(
            "must match sources/<provider>/<owner>/<repo> with components \u{2264}100 chars"
                .to_string(),
        );
    }
    Ok(())
}

/// Validate a prompt length: [10, 10000] inclusive (§8 boundary behaviors).
pub fn validate_prompt(prompt: &str) -> Result<(), String> {
    let len = prompt.chars().count();
    if len < 10 {
        return Err("must be at least 10 characters".to_string());
    }
    if len > 10_000 {
        return Err("must be at most 10000 characters".to_string());
    }
    Ok(())
}

pub fn validate_branch(branch: &str) -> Result<(), String> {
    if branch.is_empty() || branch.chars().count() > 100 {
        return Err("must be 1\u{2013}100 characters".to_string());
    }
    Ok(())
}

pub fn validate_title(title: &str) -> Result<(), String> {
    if title.chars().count() > 200 {
        return Err("must be at most 200 characters".to_string());
    }
    Ok(())
}

/// Validate a template name: non-empty, ≤100 chars (§4.7).
pub fn validate_template_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.chars().count() > 100 {
        return Err("must be 1\u{2013}100 characters".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_accepted_and_rejected() {
        assert!(is_valid_tool_name("session_create"));
        assert!(is_valid_tool_name("_private"));
        assert!(!is_valid_tool_name("1session"));
        assert!(!is_valid_tool_name("bad-name"));
        assert!(!is_valid_tool_name(""));
    }

    #[test]
    fn source_accepts_well_formed_path() {
        assert!(validate_source("sources/github/acme/web").is_ok());
    }

    #[test]
    fn source_rejects_dotdot() {
        assert!(validate_source("sources/github/../x").is_err());
    }

    #[test]
    fn source_rejects_missing_components() {
        assert!(validate_source("sources/github/acme").is_err());
    }

    #[test]
    fn prompt_boundary_values() {
        assert!(validate_prompt(&"a".repeat(9)).is_err());
        assert!(validate_prompt(&"a".repeat(10)).is_ok());
        assert!(validate_prompt(&"a".repeat(10_000)).is_ok());
        assert!(validate_prompt(&"a".repeat(10_001)).is_err());
    }

    #[test]
    fn issue_list_into_result() {
        let mut issues = IssueList::new();
        issues.push("prompt", "too short");
        let err = issues.into_result(()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
