use crate::action::ActionResult;
use crate::alert::Alert;
use crate::error::{RemedyError, Result};
use crate::rules::{Automation, DEFAULT_KIND};
use crate::workflow::WorkflowExecutor;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Executes one attempt of a queued automation. The scheduler owns retries
/// and timeouts.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(
        &self,
        automation: &Automation,
        alert: Option<&Alert>,
        context: &Value,
    ) -> Result<Vec<ActionResult>>;
}

/// Runs the automation's workflow once through a [`WorkflowExecutor`].
pub struct WorkflowWorker {
    executor: Arc<WorkflowExecutor>,
}

impl WorkflowWorker {
    pub fn new(executor: Arc<WorkflowExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Worker for WorkflowWorker {
    async fn execute(
        &self,
        automation: &Automation,
        alert: Option<&Alert>,
        context: &Value,
    ) -> Result<Vec<ActionResult>> {
        self.executor
            .execute_workflow(&automation.workflow, alert, context)
            .await
    }
}

#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<dyn Worker>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: impl Into<String>, worker: Arc<dyn Worker>) {
        let kind = kind.into();
        tracing::debug!(worker = %kind, "registering worker");
        self.workers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, worker);
    }

    /// The worker for `automation.kind`, else the `default` worker.
    pub fn select(&self, automation: &Automation) -> Result<Arc<dyn Worker>> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        workers
            .get(&automation.kind)
            .or_else(|| workers.get(DEFAULT_KIND))
            .cloned()
            .ok_or_else(|| RemedyError::NoWorkerFound(automation.kind.clone()))
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionRegistry, WorkflowStep};
    use chrono::Utc;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl Worker for Noop {
        async fn execute(&self, _: &Automation, _: Option<&Alert>, _: &Value) -> Result<Vec<ActionResult>> {
            Ok(Vec::new())
        }
    }

    fn automation(kind: &str) -> Automation {
        Automation {
            id: "a".into(),
            name: "a".into(),
            kind: kind.into(),
            conditions: vec![],
            workflow: vec![WorkflowStep::new("log", true)],
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn selection_falls_back_to_default() {
        let registry = WorkerRegistry::new();
        assert!(matches!(
            registry.select(&automation("k8s")),
            Err(RemedyError::NoWorkerFound(k)) if k == "k8s"
        ));
        registry.register(DEFAULT_KIND, Arc::new(Noop));
        assert!(registry.select(&automation("k8s")).is_ok());
        registry.register("k8s", Arc::new(Noop));
        assert_eq!(registry.kinds(), vec!["default", "k8s"]);
    }

    #[tokio::test]
    async fn workflow_worker_runs_steps_once() {
        let executor = Arc::new(WorkflowExecutor::new(
            Arc::new(ActionRegistry::with_builtins()),
            1,
            3,
            Duration::from_millis(1),
        ));
        let worker = WorkflowWorker::new(executor);
        let results = worker
            .execute(&automation("default"), None, &Value::Null)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
    }
}
