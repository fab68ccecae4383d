use crate::action::WorkflowStep;
use crate::alert::Alert;
use crate::condition::{Condition, EvalContext};
use crate::error::{RemedyError, Result};
use crate::metrics::MetricHistory;
use crate::pattern::PatternReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

pub const DEFAULT_KIND: &str = "default";

fn default_kind() -> String {
    DEFAULT_KIND.to_string()
}

fn default_enabled() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Automation
// ---------------------------------------------------------------------------

/// A registered rule: conditions that select alerts plus the workflow to run.
///
/// Never mutated once registered; updates replace the whole record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub name: String,
    /// Worker type used when the automation runs through the scheduler.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    pub conditions: Vec<Condition>,
    pub workflow: Vec<WorkflowStep>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Authoring input for [`RuleMatcher::register_automation`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutomationSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub workflow: Vec<WorkflowStep>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl AutomationSpec {
    pub fn new(conditions: Vec<Condition>, workflow: Vec<WorkflowStep>) -> Self {
        Self {
            id: None,
            name: None,
            kind: default_kind(),
            conditions,
            workflow,
            enabled: true,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workflow.is_empty() {
            return Err(RemedyError::Validation(
                "automation workflow must have at least one step".into(),
            ));
        }
        if let Some(step) = self
            .workflow
            .iter()
            .find(|s| s.action_type.trim().is_empty())
        {
            return Err(RemedyError::Validation(format!(
                "workflow step has an empty action type: {step:?}"
            )));
        }
        if self.kind.trim().is_empty() {
            return Err(RemedyError::Validation("automation type is empty".into()));
        }
        if matches!(&self.id, Some(id) if id.trim().is_empty()) {
            return Err(RemedyError::Validation("automation id is empty".into()));
        }
        self.conditions.iter().try_for_each(Condition::validate)
    }

    fn build(self, id: String, created_at: DateTime<Utc>) -> Automation {
        Automation {
            name: self.name.unwrap_or_else(|| id.clone()),
            id,
            kind: self.kind,
            conditions: self.conditions,
            workflow: self.workflow,
            enabled: self.enabled,
            created_at,
        }
    }
}

impl Automation {
    /// All conditions ANDed. An automation without conditions is
    /// schedule-only and never matches an alert.
    pub fn matches(&self, alert: &Alert, ctx: &EvalContext) -> bool {
        self.enabled
            && !self.conditions.is_empty()
            && self.conditions.iter().all(|c| c.evaluate(alert, ctx))
    }
}

// ---------------------------------------------------------------------------
// RuleMatcher
// ---------------------------------------------------------------------------

/// Automation registry plus the condition evaluator that selects matches.
pub struct RuleMatcher {
    automations: RwLock<Vec<Arc<Automation>>>,
    metrics: Mutex<MetricHistory>,
}

impl RuleMatcher {
    pub fn new(max_metric_samples: usize) -> Self {
        Self {
            automations: RwLock::new(Vec::new()),
            metrics: Mutex::new(MetricHistory::new(max_metric_samples)),
        }
    }

    /// Validate and register. Nothing is stored if validation fails.
    pub fn register_automation(&self, spec: AutomationSpec) -> Result<String> {
        spec.validate()?;
        let mut list = self
            .automations
            .write()
            .map_err(|_| RemedyError::Validation("automation registry poisoned".into()))?;
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if list.iter().any(|a| a.id == id) {
            return Err(RemedyError::Validation(format!(
                "automation '{id}' is already registered"
            )));
        }
        let automation = spec.build(id.clone(), Utc::now());
        tracing::info!(
            automation = %id,
            conditions = automation.conditions.len(),
            steps = automation.workflow.len(),
            "automation registered"
        );
        list.push(Arc::new(automation));
        Ok(id)
    }

    /// Replace an automation in place, keeping its registration slot.
    pub fn update_automation(&self, id: &str, spec: AutomationSpec) -> Result<Arc<Automation>> {
        spec.validate()?;
        let mut list = self
            .automations
            .write()
            .map_err(|_| RemedyError::Validation("automation registry poisoned".into()))?;
        let slot = list
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| RemedyError::AutomationNotFound(id.to_string()))?;
        let updated = Arc::new(spec.build(id.to_string(), slot.created_at));
        *slot = updated.clone();
        Ok(updated)
    }

    pub fn remove_automation(&self, id: &str) -> Result<Arc<Automation>> {
        let mut list = self
            .automations
            .write()
            .map_err(|_| RemedyError::Validation("automation registry poisoned".into()))?;
        let pos = list
            .iter()
            .position(|a| a.id == id)
            .ok_or_else(|| RemedyError::AutomationNotFound(id.to_string()))?;
        Ok(list.remove(pos))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Automation>> {
        self.automations
            .read()
            .ok()?
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    /// All automations in registration order.
    pub fn list(&self) -> Vec<Arc<Automation>> {
        self.automations
            .read()
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    /// Record the alert's values for every metric a trend condition watches.
    pub fn observe(&self, alert: &Alert) {
        let watched: BTreeSet<String> = self
            .list()
            .iter()
            .filter(|a| a.enabled)
            .flat_map(|a| {
                a.conditions
                    .iter()
                    .flat_map(|c| c.trend_metrics())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();
        if watched.is_empty() {
            return;
        }
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        for path in &watched {
            if let Some(v) = alert.metric(path) {
                metrics.record(path, v);
            }
        }
    }

    /// Matching automations, in registration order.
    pub fn find_matching_automations(
        &self,
        alert: &Alert,
        patterns: &PatternReport,
    ) -> Vec<Arc<Automation>> {
        let metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = EvalContext {
            metrics: &metrics,
            patterns,
        };
        self.list()
            .into_iter()
            .filter(|a| a.matches(alert, &ctx))
            .collect()
    }
}

impl Default for RuleMatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
