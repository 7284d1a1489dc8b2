//! The Template Registry (§4.7): named, reusable session configurations.
//!
//! Creation fails on a duplicate name, an over-length name, or when the
//! registry is at capacity; `createFromTemplate` merges caller overrides over
//! the stored config and delegates to the Session Manager, then increments
//! the usage counter.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::persistence::{Persistence, TemplateRecord};
use crate::session::{Session, SessionConfig, SessionManager};
use crate::validator::{validate_template_name, IssueList};

#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub config: Value,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "usageCount")]
    pub usage_count: i64,
}

impl From<TemplateRecord> for Template {
    fn from(r: TemplateRecord) -> Self {
        Self {
            name: r.name,
            description: r.description,
            config: r.config,
            created_at: r.created_at,
            usage_count: r.usage_count,
        }
    }
}

/// Owns the template catalog. Cheaply cloneable.
#[derive(Clone)]
pub struct TemplateManager {
    persistence: Persistence,
    cap: usize,
}

impl TemplateManager {
    pub fn new(persistence: Persistence, cap: usize) -> Self {
        Self { persistence, cap }
    }

    pub async fn create(&self, name: String, description: Option<String>, config: Value) -> AppResult<Template> {
        let mut issues = IssueList::new();
        if let Err(msg) = validate_template_name(&name) {
            issues.push("name", msg);
        }
        issues.into_result(())?;

        let count = self.persistence.count_templates().await.map_err(AppError::Internal)?;
        if count >= self.cap as i64 {
            return Err(AppError::Conflict(format!("template registry is full (cap {})", self.cap)));
        }

        let record = TemplateRecord {
            name: name.clone(),
            description,
            config,
            created_at: Utc::now().to_rfc3339(),
            usage_count: 0,
        };
        let inserted = self.persistence.insert_template(&record).await.map_err(AppError::Internal)?;
        if !inserted {
            return Err(AppError::Conflict(format!("template {name} already exists")));
        }
        Ok(record.into())
    }

    pub async fn list(&self) -> AppResult<Vec<Template>> {
        Ok(self
            .persistence
            .list_templates()
            .await
            .map_err(AppError::Internal)?
            .into_iter()
            .map(Template::from)
            .collect())
    }

    pub async fn get(&self, name: &str) -> AppResult<Template> {
        self.persistence
            .get_template(name)
            .await
            .map_err(AppError::Internal)?
            .map(Template::from)
            .ok_or_else(|| AppError::NotFound(format!("template {name} not found")))
    }

    pub async fn delete(&self, name: &str) -> AppResult<()> {
        let deleted = self.persistence.delete_template(name).await.map_err(AppError::Internal)?;
        if !deleted {
            return Err(AppError::NotFound(format!("template {name} not found")));
        }
        Ok(())
    }

    /// Merges `overrides` over the stored config and delegates to the
    /// Session Manager. Usage is only incremented once session creation
    /// succeeds.
    pub async fn create_from_template(
        &self,
        name: &str,
        overrides: Option<Value>,
        sessions: &SessionManager,
    ) -> AppResult<Session> {
        let record = self
            .persistence
            .get_template(name)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::NotFound(format!("template {name} not found")))?;

        let mut merged = record.config.clone();
        if let Some(overrides) = overrides {
            merge_json(&mut merged, overrides);
        }
        let config: SessionConfig = serde_json::from_value(merged)
            .map_err(|e| AppError::Validation(format!("merged template config is invalid: {e}")))?;

        let session = sessions.create(config).await?;
        self.persistence.increment_template_usage(name).await.map_err(AppError::Internal)?;
        Ok(session)
    }
}

/// Deep-merges `overrides` into `base`: objects merge key-wise, anything
/// else is replaced wholesale.
fn merge_json(base: &mut Value, overrides: Value) {
    match overrides {
        Value::Object(override_map) => {
            if let Value::Object(base_map) = base {
                for (k, v) in override_map {
                    match base_map.get_mut(&k) {
                        Some(existing) => merge_json(existing, v),
                        None => {
                            base_map.insert(k, v);
                        }
                    }
                }
            } else {
                *base = Value::Object(override_map);
            }
        }
        other => *base = other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    async fn manager(cap: usize) -> TemplateManager {
        let persistence = Persistence::connect(None, Path::new("/tmp/unused")).await.unwrap();
        TemplateManager::new(persistence, cap)
    }

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let m = manager(100).await;
        m.create("t1".to_string(), Some("desc".to_string()), json!({"prompt": "hi"}))
            .await
            .unwrap();
        let fetched = m.get("t1").await.unwrap();
        assert_eq!(fetched.usage_count, 0);
        assert_eq!(fetched.config, json!({"prompt": "hi"}));
    }

    #[tokio::test]
    async fn duplicate_name_is_conflict() {
        let m = manager(100).await;
        m.create("dup".to_string(), None, json!({})).await.unwrap();
        let err = m.create("dup".to_string(), None, json!({})).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn over_length_name_is_validation_error() {
        let m = manager(100).await;
        let name = "a".repeat(101);
        let err = m.create(name, None, json!({})).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn cap_reached_is_conflict() {
        let m = manager(1).await;
        m.create("first".to_string(), None, json!({})).await.unwrap();
        let err = m.create("second".to_string(), None, json!({})).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let m = manager(100).await;
        let err = m.delete("nope").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn merge_overrides_nested_objects() {
        let mut base = json!({"prompt": "a", "nested": {"x": 1, "y": 2}});
        merge_json(&mut base, json!({"nested": {"y": 9}, "title": "t"}));
        assert_eq!(base, json!({"prompt": "a", "nested": {"x": 1, "y": 9}, "title": "t"}));
    }
}
