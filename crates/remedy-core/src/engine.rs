//! Composition root: builds every component from a [`Config`] and wires
//! alerts through detection, matching and execution.

use crate::action::{Action, ActionRegistry};
use crate::alert::Alert;
use crate::config::Config;
use crate::error::{RemedyError, Result};
use crate::pattern::{Correlation, FrequentPattern, PatternDetector, PatternReport, SequentialPattern};
use crate::rules::{Automation, AutomationSpec, RuleMatcher};
use crate::scheduler::{
    QueueHistoryFilter, QueueItem, Schedule, ScheduleConfig, ScheduleFilter, Scheduler,
    SchedulerStats, Worker, WorkflowWorker,
};
use crate::state::{StateListener, StateManager, StateRecord, Transition, TransitionValidator};
use crate::types::LifecycleState;
use crate::workflow::{AutomationRun, RunObserver, WorkflowExecutor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What happened when one alert went through [`Engine::handle_alert`].
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: String,
    pub alert: Alert,
    pub automations: Vec<String>,
    pub runs: Vec<AutomationRun>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// What [`Engine::route_alert`] did with each match.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutedAlert {
    /// Queue item ids, in match order.
    pub queued: Vec<String>,
    pub rejected: Vec<RejectedMatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedMatch {
    pub automation_id: String,
    pub error: String,
}

/// Filter for [`Engine::get_history`]. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub alert_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl HistoryFilter {
    fn matches(&self, entry: &HistoryEntry) -> bool {
        self.alert_type
            .as_deref()
            .map_or(true, |t| entry.alert.alert_type == t)
            && self.since.map_or(true, |s| entry.timestamp >= s)
    }
}

pub struct Engine {
    config: Config,
    actions: Arc<ActionRegistry>,
    executor: Arc<WorkflowExecutor>,
    detector: Arc<PatternDetector>,
    matcher: Arc<RuleMatcher>,
    states: Arc<StateManager>,
    scheduler: Arc<Scheduler>,
    history: Mutex<VecDeque<HistoryEntry>>,
}

impl Engine {
    /// Build every component. Fails if the config has error-level findings.
    pub fn new(config: Config) -> Result<Self> {
        config.ensure_valid()?;
        let actions = Arc::new(ActionRegistry::with_builtins());
        let executor = Arc::new(WorkflowExecutor::from_config(
            Arc::clone(&actions),
            &config.scheduler,
        ));
        let detector = Arc::new(PatternDetector::new(config.patterns.clone()));
        let matcher = Arc::new(RuleMatcher::new(config.engine.max_metric_samples));
        let states = Arc::new(StateManager::with_lifecycle(config.state.clone()));
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            Arc::clone(&states),
        ));
        scheduler.register_worker(
            crate::rules::DEFAULT_KIND,
            Arc::new(WorkflowWorker::new(Arc::clone(&executor))),
        );
        Ok(Self {
            config,
            actions,
            executor,
            detector,
            matcher,
            states,
            scheduler,
            history: Mutex::new(VecDeque::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn states(&self) -> &Arc<StateManager> {
        &self.states
    }

    pub fn detector(&self) -> &Arc<PatternDetector> {
        &self.detector
    }

    pub fn matcher(&self) -> &Arc<RuleMatcher> {
        &self.matcher
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor> {
        &self.executor
    }

    // -----------------------------------------------------------------------
    // Alert paths
    // -----------------------------------------------------------------------

    fn ingest(&self, alert: &Alert) -> Result<Vec<Arc<Automation>>> {
        alert.validate()?;
        self.detector.observe(alert);
        self.matcher.observe(alert);
        let report = self.detector.report();
        let matched = self.matcher.find_matching_automations(alert, &report);
        tracing::debug!(
            alert = %alert.id,
            alert_type = %alert.alert_type,
            matched = matched.len(),
            "alert ingested"
        );
        Ok(matched)
    }

    /// Match `alert` and run every matching automation right away.
    ///
    /// Each run is tracked as a state-machine instance
    /// (`created -> queued -> running -> completed | failed`). A run only
    /// enters `running` once it holds an execution slot. A run whose
    /// `running` transition is refused is moved to `cancelled` and reported
    /// as failed.
    pub async fn handle_alert(&self, alert: Alert) -> Result<HistoryEntry> {
        let matched = self.ingest(&alert)?;

        let run_ids: Vec<String> = matched.iter().map(|_| Uuid::new_v4().to_string()).collect();
        let mut refused = Vec::with_capacity(matched.len());
        for (run_id, automation) in run_ids.iter().zip(&matched) {
            let context = json!({ "automation_id": automation.id, "alert_id": alert.id });
            refused.push(
                self.states
                    .update_state(run_id, LifecycleState::Queued, context)
                    .await
                    .err(),
            );
        }

        let tracker = RunTracker {
            states: &self.states,
            run_ids: &run_ids,
            alert_id: &alert.id,
            refused: Mutex::new(refused),
        };
        let response = json!({ "alert_id": alert.id, "alert_type": alert.alert_type });
        let runs = self
            .executor
            .execute_automations_observed(&matched, Some(&alert), &response, &tracker)
            .await;

        let entry = HistoryEntry {
            id: Uuid::new_v4().to_string(),
            automations: matched.iter().map(|a| a.id.clone()).collect(),
            success: runs.iter().all(|r| r.success),
            runs,
            alert,
            timestamp: Utc::now(),
        };
        if entry.automations.is_empty() {
            tracing::debug!(alert = %entry.alert.id, "no automation matched");
        } else {
            tracing::info!(
                alert = %entry.alert.id,
                automations = entry.automations.len(),
                success = entry.success,
                "alert handled"
            );
        }

        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(entry.clone());
        while history.len() > self.config.engine.max_history {
            history.pop_front();
        }
        Ok(entry)
    }

    /// Match `alert` and enqueue each match on the scheduler at the alert's
    /// priority weight. A match the scheduler refuses, for instance on a
    /// full queue, is reported in [`RoutedAlert::rejected`] and recorded in
    /// the queue history as failed; the remaining matches are still queued.
    pub async fn route_alert(&self, alert: Alert) -> Result<RoutedAlert> {
        let matched = self.ingest(&alert)?;
        let priority = alert.priority.weight();
        let mut routed = RoutedAlert::default();
        for automation in matched {
            let automation_id = automation.id.clone();
            match self
                .scheduler
                .queue_automation(automation, priority, Some(alert.clone()))
                .await
            {
                Ok(id) => routed.queued.push(id),
                Err(e) => {
                    tracing::warn!(
                        alert = %alert.id,
                        automation = %automation_id,
                        error = %e,
                        "match not queued"
                    );
                    routed.rejected.push(RejectedMatch {
                        automation_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(routed)
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn register_automation(&self, spec: AutomationSpec) -> Result<String> {
        self.matcher.register_automation(spec)
    }

    pub fn update_automation(&self, id: &str, spec: AutomationSpec) -> Result<Arc<Automation>> {
        let updated = self.matcher.update_automation(id, spec)?;
        self.scheduler.replace_automation(&updated);
        Ok(updated)
    }

    /// Remove an automation. Rejected while any schedule still targets it.
    pub fn delete_automation(&self, id: &str) -> Result<Arc<Automation>> {
        let schedules = self.scheduler.get_schedules(&ScheduleFilter {
            automation_id: Some(id.to_string()),
            ..ScheduleFilter::default()
        });
        if !schedules.is_empty() {
            let ids: Vec<&str> = schedules.iter().map(|s| s.id.as_str()).collect();
            return Err(RemedyError::AutomationInUse {
                id: id.to_string(),
                schedules: ids.join(", "),
            });
        }
        self.matcher.remove_automation(id)
    }

    pub fn register_action(&self, action_type: impl Into<String>, action: Arc<dyn Action>) {
        self.actions.register(action_type, action);
    }

    pub fn register_worker(&self, kind: impl Into<String>, worker: Arc<dyn Worker>) {
        self.scheduler.register_worker(kind, worker);
    }

    pub fn register_state(&self, state: LifecycleState, terminal: bool) {
        self.states.register_state(state, terminal);
    }

    pub fn register_transition(
        &self,
        from: LifecycleState,
        to: LifecycleState,
        validator: Option<Arc<dyn TransitionValidator>>,
    ) {
        self.states.register_transition(from, to, validator);
    }

    pub fn add_state_listener(&self, listener: Arc<dyn StateListener>) {
        self.states.add_listener(listener);
    }

    pub async fn update_state(
        &self,
        id: &str,
        state: LifecycleState,
        context: Value,
    ) -> Result<Transition> {
        self.states.update_state(id, state, context).await
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    fn automation(&self, id: &str) -> Result<Arc<Automation>> {
        self.matcher
            .get(id)
            .ok_or_else(|| RemedyError::AutomationNotFound(id.to_string()))
    }

    pub fn schedule_automation(&self, config: ScheduleConfig) -> Result<Schedule> {
        self.schedule_automation_at(config, Utc::now())
    }

    pub fn schedule_automation_at(
        &self,
        config: ScheduleConfig,
        now: DateTime<Utc>,
    ) -> Result<Schedule> {
        let automation = self.automation(&config.automation_id)?;
        self.scheduler.schedule_automation_at(automation, config, now)
    }

    /// Enqueue a registered automation by id, at the default priority unless
    /// one is given.
    pub async fn queue_automation(
        &self,
        automation_id: &str,
        priority: Option<u32>,
        alert: Option<Alert>,
    ) -> Result<String> {
        let automation = self.automation(automation_id)?;
        let priority = priority.unwrap_or(self.config.scheduler.default_priority);
        self.scheduler
            .queue_automation(automation, priority, alert)
            .await
    }

    // -----------------------------------------------------------------------
    // Patterns
    // -----------------------------------------------------------------------

    pub fn detect_patterns(&self) -> PatternReport {
        self.detector.detect()
    }

    pub fn detect_patterns_at(&self, now: DateTime<Utc>) -> PatternReport {
        self.detector.detect_at(now)
    }

    pub fn get_patterns(&self) -> Vec<FrequentPattern> {
        self.detector.get_patterns()
    }

    pub fn get_sequences(&self) -> Vec<SequentialPattern> {
        self.detector.get_sequences()
    }

    pub fn get_correlations(&self) -> Vec<Correlation> {
        self.detector.get_correlations()
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub fn get_history(&self, filter: &HistoryFilter) -> Vec<HistoryEntry> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn get_queue(&self) -> Vec<QueueItem> {
        self.scheduler.get_queue()
    }

    pub fn get_running(&self) -> Vec<QueueItem> {
        self.scheduler.get_running()
    }

    pub fn get_queue_history(&self, filter: &QueueHistoryFilter) -> Vec<QueueItem> {
        self.scheduler.get_history(filter)
    }

    pub fn get_schedules(&self, filter: &ScheduleFilter) -> Vec<Schedule> {
        self.scheduler.get_schedules(filter)
    }

    pub async fn get_states(&self) -> Vec<StateRecord> {
        self.states.get_states().await
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    /// Start the scheduler loops plus periodic pattern detection and state
    /// cleanup. Everything stops when `token` is cancelled.
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = self.scheduler.start(token.clone());

        let detector = Arc::clone(&self.detector);
        handles.push(periodic(
            "pattern detection",
            self.config.patterns.detection_interval(),
            token.clone(),
            move || {
                detector.detect();
                async {}
            },
        ));

        let states = Arc::clone(&self.states);
        handles.push(periodic(
            "state cleanup",
            self.config.state.cleanup_interval(),
            token,
            move || {
                let states = Arc::clone(&states);
                async move {
                    states.cleanup().await;
                }
            },
        ));
        handles
    }
}

/// Moves direct runs through the state machine from inside their
/// execution slot.
struct RunTracker<'a> {
    states: &'a StateManager,
    run_ids: &'a [String],
    alert_id: &'a str,
    /// Runs whose `queued` transition was refused, by index.
    refused: Mutex<Vec<Option<RemedyError>>>,
}

#[async_trait]
impl RunObserver for RunTracker<'_> {
    async fn admitted(&self, index: usize, automation: &Automation) -> Result<()> {
        let refused = self.refused.lock().unwrap_or_else(|e| e.into_inner())[index].take();
        if let Some(e) = refused {
            return Err(e);
        }
        let run_id = &self.run_ids[index];
        let context = json!({ "automation_id": automation.id, "alert_id": self.alert_id });
        if let Err(e) = self
            .states
            .update_state(run_id, LifecycleState::Running, context)
            .await
        {
            let context = json!({ "reason": e.to_string() });
            if let Err(e) = self
                .states
                .update_state(run_id, LifecycleState::Cancelled, context)
                .await
            {
                tracing::warn!(run = %run_id, error = %e, "could not cancel refused run");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn finished(&self, index: usize, run: &AutomationRun) {
        let run_id = &self.run_ids[index];
        let target = if run.success {
            LifecycleState::Completed
        } else {
            LifecycleState::Failed
        };
        let context = json!({ "attempts": run.attempts, "error": run.error });
        if let Err(e) = self.states.update_state(run_id, target, context).await {
            tracing::warn!(run = %run_id, error = %e, "could not record run outcome");
        }
    }
}

fn periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so a freshly started
        // engine does not run every job at once.
        interval.tick().await;
        tracing::info!(job = name, period_secs = period.as_secs(), "periodic job started");
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = interval.tick() => job().await,
            }
        }
        tracing::info!(job = name, "periodic job stopped");
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
