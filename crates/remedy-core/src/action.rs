//! Workflow steps and the registry of operator-supplied action handlers.
//!
//! A workflow step names an action `type`; the handler registered under that
//! type does the real work (page someone, scale a service, open a ticket).
//! Handlers return an explicit [`ActionOutcome`] and the executor decides from
//! it whether the workflow continues.

use crate::alert::Alert;
use crate::error::{RemedyError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

// ---------------------------------------------------------------------------
// WorkflowStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub params: Value,
    /// A failing required step aborts the rest of the workflow.
    #[serde(default)]
    pub required: bool,
}

impl WorkflowStep {
    pub fn new(action_type: impl Into<String>, required: bool) -> Self {
        Self {
            action_type: action_type.into(),
            params: Value::Null,
            required,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What a handler reports back for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ActionOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            message: Some(message.into()),
        }
    }
}

/// The recorded result of one executed workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub step: usize,
    pub action_type: String,
    pub required: bool,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Action trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Action: Send + Sync {
    /// Run the action. `context` carries the caller's response payload
    /// (for scheduled runs, the schedule and attempt details).
    async fn execute(
        &self,
        params: &Value,
        alert: Option<&Alert>,
        context: &Value,
    ) -> Result<ActionOutcome>;
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, Arc<dyn Action>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in `log`, `delay` and `fail` actions.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("log", Arc::new(LogAction));
        registry.register("delay", Arc::new(DelayAction));
        registry.register("fail", Arc::new(FailAction));
        registry
    }

    /// Register (or replace) the handler for `action_type`.
    pub fn register(&self, action_type: impl Into<String>, action: Arc<dyn Action>) {
        let action_type = action_type.into();
        tracing::debug!(action = %action_type, "registering action");
        if let Ok(mut map) = self.actions.write() {
            map.insert(action_type, action);
        }
    }

    pub fn resolve(&self, action_type: &str) -> Result<Arc<dyn Action>> {
        self.actions
            .read()
            .ok()
            .and_then(|map| map.get(action_type).cloned())
            .ok_or_else(|| RemedyError::UnknownAction(action_type.to_string()))
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.actions
            .read()
            .map(|map| map.contains_key(action_type))
            .unwrap_or(false)
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .actions
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        types.sort();
        types
    }
}

// ---------------------------------------------------------------------------
// Built-in actions
// ---------------------------------------------------------------------------

/// Emits a tracing event with `params.message`.
pub struct LogAction;

#[async_trait]
impl Action for LogAction {
    async fn execute(
        &self,
        params: &Value,
        alert: Option<&Alert>,
        _context: &Value,
    ) -> Result<ActionOutcome> {
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("remediation step");
        match alert {
            Some(a) => tracing::info!(alert = %a.id, alert_type = %a.alert_type, "{message}"),
            None => tracing::info!("{message}"),
        }
        Ok(ActionOutcome::ok(Value::String(message.to_string())))
    }
}

/// Sleeps for `params.ms` milliseconds.
pub struct DelayAction;

#[async_trait]
impl Action for DelayAction {
    async fn execute(
        &self,
        params: &Value,
        _alert: Option<&Alert>,
        _context: &Value,
    ) -> Result<ActionOutcome> {
        let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ActionOutcome::ok(serde_json::json!({ "slept_ms": ms })))
    }
}

/// Always fails, with `params.message` as the reason. Useful for drills.
pub struct FailAction;

#[async_trait]
impl Action for FailAction {
    async fn execute(
        &self,
        params: &Value,
        _alert: Option<&Alert>,
        _context: &Value,
    ) -> Result<ActionOutcome> {
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("forced failure");
        Ok(ActionOutcome::failed(message))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn builtins_resolve_and_run() {
        let registry = ActionRegistry::with_builtins();
        assert_eq!(registry.types(), vec!["delay", "fail", "log"]);

        let log = registry.resolve("log").unwrap();
        let out = log
            .execute(&json!({"message": "hi"}), None, &Value::Null)
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.data, json!("hi"));

        let fail = registry.resolve("fail").unwrap();
        let out = fail.execute(&Value::Null, None, &Value::Null).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.message.as_deref(), Some("forced failure"));
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = ActionRegistry::new();
        let err = registry.resolve("page").err().unwrap();
        assert!(matches!(err, RemedyError::UnknownAction(t) if t == "page"));
    }

    #[test]
    fn step_yaml_defaults() {
        let step: WorkflowStep = serde_yaml::from_str("type: notify\n").unwrap();
        assert_eq!(step.action_type, "notify");
        assert!(!step.required);
        assert!(step.params.is_null());
    }
}
