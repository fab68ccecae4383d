//! Ordered workflow execution with bounded concurrency and whole-workflow retry.
//!
//! Steps of one workflow always run one after another. Several automations
//! may run side by side, admitted through a semaphore sized by the
//! configured concurrency limit. Retrying re-runs the entire workflow, so
//! steps that succeeded before a failure run again: delivery is
//! at-least-once.

use crate::action::{ActionRegistry, ActionResult, WorkflowStep};
use crate::alert::Alert;
use crate::config::SchedulerConfig;
use crate::error::{RemedyError, Result};
use crate::rules::Automation;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Summary of one automation run through [`WorkflowExecutor::execute_automations`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRun {
    pub automation_id: String,
    pub success: bool,
    pub attempts: u32,
    pub results: Vec<ActionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Linear backoff: `delay × attempt`, saturating instead of overflowing.
pub fn backoff(delay: Duration, attempt: u32) -> Duration {
    delay.saturating_mul(attempt)
}

/// Hooks around each run of [`WorkflowExecutor::execute_automations_observed`].
/// Both are called while the run holds its execution slot.
#[async_trait]
pub trait RunObserver: Send + Sync {
    /// The run got a slot. An error skips the run and is reported as its
    /// failure.
    async fn admitted(&self, _index: usize, _automation: &Automation) -> Result<()> {
        Ok(())
    }

    /// The run finished, successfully or not.
    async fn finished(&self, _index: usize, _run: &AutomationRun) {}
}

impl RunObserver for () {}

pub struct WorkflowExecutor {
    actions: Arc<ActionRegistry>,
    semaphore: Arc<Semaphore>,
    concurrent_limit: usize,
    max_retries: u32,
    retry_delay: Duration,
}

impl WorkflowExecutor {
    pub fn new(
        actions: Arc<ActionRegistry>,
        concurrent_limit: usize,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        let concurrent_limit = concurrent_limit.max(1);
        Self {
            actions,
            semaphore: Arc::new(Semaphore::new(concurrent_limit)),
            concurrent_limit,
            max_retries: max_retries.max(1),
            retry_delay,
        }
    }

    pub fn from_config(actions: Arc<ActionRegistry>, config: &SchedulerConfig) -> Self {
        Self::new(
            actions,
            config.max_concurrent,
            config.max_retries,
            config.retry_delay(),
        )
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    pub fn concurrent_limit(&self) -> usize {
        self.concurrent_limit
    }

    /// Number of automations currently holding an execution slot.
    pub fn in_flight(&self) -> usize {
        self.concurrent_limit - self.semaphore.available_permits()
    }

    /// Run `steps` strictly in order.
    ///
    /// A failed non-required step is recorded and execution continues. The
    /// first failed required step stops the workflow with
    /// [`RemedyError::WorkflowAborted`] carrying every result so far.
    pub async fn execute_workflow(
        &self,
        steps: &[WorkflowStep],
        alert: Option<&Alert>,
        context: &Value,
    ) -> Result<Vec<ActionResult>> {
        let mut results = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            let action = self.actions.resolve(&step.action_type)?;
            let started_at = Utc::now();
            let clock = Instant::now();
            let outcome = action.execute(&step.params, alert, context).await;
            let duration_ms = clock.elapsed().as_millis() as u64;

            let result = match outcome {
                Ok(out) => ActionResult {
                    step: index,
                    action_type: step.action_type.clone(),
                    required: step.required,
                    success: out.success,
                    error: if out.success { None } else { out.message },
                    data: out.data,
                    started_at,
                    duration_ms,
                },
                Err(e) => ActionResult {
                    step: index,
                    action_type: step.action_type.clone(),
                    required: step.required,
                    success: false,
                    data: Value::Null,
                    error: Some(e.to_string()),
                    started_at,
                    duration_ms,
                },
            };

            if !result.success {
                tracing::warn!(
                    step = index,
                    action = %step.action_type,
                    required = step.required,
                    error = result.error.as_deref().unwrap_or("unsuccessful"),
                    "workflow step failed"
                );
            }
            let abort = step.required && !result.success;
            results.push(result);
            if abort {
                return Err(RemedyError::WorkflowAborted {
                    step: step.action_type.clone(),
                    index,
                    results,
                });
            }
        }
        Ok(results)
    }

    /// Run the whole workflow, retrying on retryable errors with a linear
    /// backoff of `retry_delay × attempt`. Exhaustion returns the last error.
    pub async fn execute_with_retry(
        &self,
        automation: &Automation,
        alert: Option<&Alert>,
        context: &Value,
    ) -> Result<Vec<ActionResult>> {
        self.run_with_retry(automation, alert, context).await.0
    }

    async fn run_with_retry(
        &self,
        automation: &Automation,
        alert: Option<&Alert>,
        context: &Value,
    ) -> (Result<Vec<ActionResult>>, u32) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .execute_workflow(&automation.workflow, alert, context)
                .await
            {
                Ok(results) => return (Ok(results), attempt),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let wait = backoff(self.retry_delay, attempt);
                    tracing::info!(
                        automation = %automation.id,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "retrying workflow"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    tracing::warn!(
                        automation = %automation.id,
                        attempts = attempt,
                        error = %e,
                        "workflow failed"
                    );
                    return (Err(e), attempt);
                }
            }
        }
    }

    /// Run several automations concurrently, at most `concurrent_limit` at a
    /// time. Results come back in the order of `automations`.
    pub async fn execute_automations(
        &self,
        automations: &[Arc<Automation>],
        alert: Option<&Alert>,
        response: &Value,
    ) -> Vec<AutomationRun> {
        self.execute_automations_observed(automations, alert, response, &())
            .await
    }

    /// [`execute_automations`](Self::execute_automations) with `observer`
    /// told when each run starts and ends.
    pub async fn execute_automations_observed(
        &self,
        automations: &[Arc<Automation>],
        alert: Option<&Alert>,
        response: &Value,
        observer: &dyn RunObserver,
    ) -> Vec<AutomationRun> {
        let runs = automations.iter().enumerate().map(|(index, automation)| async move {
            let skipped = |error: String| AutomationRun {
                automation_id: automation.id.clone(),
                success: false,
                attempts: 0,
                results: Vec::new(),
                error: Some(error),
            };
            let Ok(_permit) = self.semaphore.acquire().await else {
                return skipped("executor closed".into());
            };
            if let Err(e) = observer.admitted(index, automation).await {
                return skipped(e.to_string());
            }
            let run = self.run_once(automation, alert, response).await;
            observer.finished(index, &run).await;
            run
        });
        futures::future::join_all(runs).await
    }

    async fn run_once(
        &self,
        automation: &Automation,
        alert: Option<&Alert>,
        response: &Value,
    ) -> AutomationRun {
        let (outcome, attempts) = self.run_with_retry(automation, alert, response).await;
        match outcome {
            Ok(results) => AutomationRun {
                automation_id: automation.id.clone(),
                success: true,
                attempts,
                results,
                error: None,
            },
            Err(e) => {
                let message = e.to_string();
                let results = match e {
                    RemedyError::WorkflowAborted { results, .. } => results,
                    _ => Vec::new(),
                };
                AutomationRun {
                    automation_id: automation.id.clone(),
                    success: false,
                    attempts,
                    results,
                    error: Some(message),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
