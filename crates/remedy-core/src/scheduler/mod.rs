//! Priority queue, recurring schedules and the worker dispatch loop.
//!
//! Every queue item is an instance in the [`StateManager`]. A fresh item
//! moves `created -> queued -> running` and ends `completed`, `failed` or
//! `cancelled`; schedule-triggered items pass through `scheduled` first.
//! Retries keep the item `running` between attempts.
//!
//! Pausing never preempts an in-flight attempt. A paused item's next retry
//! or its completion is parked until [`Scheduler::resume`].

pub mod queue;
pub mod schedule;
pub mod worker;

pub use queue::{PriorityQueue, QueueItem};
pub use schedule::{Frequency, Schedule, ScheduleConfig, ScheduleFilter, ScheduleStatus};
pub use worker::{Worker, WorkerRegistry, WorkflowWorker};

use crate::action::ActionResult;
use crate::config::SchedulerConfig;
use crate::error::{RemedyError, Result};
use crate::rules::Automation;
use crate::state::StateManager;
use crate::types::{LifecycleState, QueueStatus};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub retrying: usize,
    pub parked: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub schedules: usize,
}

/// Filter for [`Scheduler::get_history`]. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct QueueHistoryFilter {
    pub status: Option<QueueStatus>,
    pub automation_id: Option<String>,
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

enum Parked {
    Retry(QueueItem),
    Finished(QueueItem, QueueStatus),
}

impl Parked {
    fn item(&self) -> &QueueItem {
        match self {
            Parked::Retry(item) | Parked::Finished(item, _) => item,
        }
    }
}

struct Inner {
    queue: PriorityQueue,
    /// Slots claimed by enqueues whose state transition is still in flight.
    reserved: usize,
    running: HashMap<String, QueueItem>,
    retrying: HashMap<String, QueueItem>,
    parked: HashMap<String, Parked>,
    history: VecDeque<QueueItem>,
    completed: u64,
    failed: u64,
    cancelled: u64,
}

impl Inner {
    fn has_room(&self) -> bool {
        self.queue.len() + self.reserved < self.queue.capacity()
    }
}

struct ScheduleEntry {
    schedule: Schedule,
    automation: Arc<Automation>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    config: SchedulerConfig,
    workers: WorkerRegistry,
    states: Arc<StateManager>,
    inner: Mutex<Inner>,
    schedules: Mutex<Vec<ScheduleEntry>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, states: Arc<StateManager>) -> Self {
        let inner = Inner {
            queue: PriorityQueue::new(config.max_queue_size),
            reserved: 0,
            running: HashMap::new(),
            retrying: HashMap::new(),
            parked: HashMap::new(),
            history: VecDeque::new(),
            completed: 0,
            failed: 0,
            cancelled: 0,
        };
        Self {
            config,
            workers: WorkerRegistry::new(),
            states,
            inner: Mutex::new(inner),
            schedules: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn states(&self) -> &Arc<StateManager> {
        &self.states
    }

    pub fn register_worker(&self, kind: impl Into<String>, worker: Arc<dyn Worker>) {
        self.workers.register(kind, worker);
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_schedules(&self) -> MutexGuard<'_, Vec<ScheduleEntry>> {
        self.schedules.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    /// Enqueue a run of `automation`. Fails with [`RemedyError::QueueFull`]
    /// once the queue holds `max_queue_size` items. A rejected run is still
    /// recorded in the history, as failed.
    pub async fn queue_automation(
        &self,
        automation: Arc<Automation>,
        priority: u32,
        alert: Option<crate::alert::Alert>,
    ) -> Result<String> {
        self.enqueue(QueueItem::new(automation, priority, alert)).await
    }

    async fn enqueue(&self, mut item: QueueItem) -> Result<String> {
        if self.shutdown.is_cancelled() {
            return Err(RemedyError::ShuttingDown);
        }
        let full = {
            let mut inner = self.lock();
            if inner.has_room() {
                inner.reserved += 1;
                None
            } else {
                Some(inner.queue.capacity())
            }
        };
        if let Some(capacity) = full {
            tracing::warn!(automation = %item.automation.id, "queue full, rejecting");
            let e = RemedyError::QueueFull(capacity);
            item.error = Some(e.to_string());
            self.record(item, QueueStatus::Failed);
            return Err(e);
        }

        let context = json!({
            "automation_id": item.automation.id,
            "priority": item.priority,
            "schedule_id": item.schedule_id,
        });
        let transitioned = async {
            if item.schedule_id.is_some() {
                self.states
                    .update_state(&item.id, LifecycleState::Scheduled, context.clone())
                    .await?;
            }
            self.states
                .update_state(&item.id, LifecycleState::Queued, context)
                .await
        }
        .await;

        let id = item.id.clone();
        let automation_id = item.automation.id.clone();
        let priority = item.priority;
        let rejected = {
            let mut inner = self.lock();
            inner.reserved -= 1;
            match transitioned {
                Err(e) => Some((item, e)),
                Ok(_) if self.shutdown.is_cancelled() => Some((item, RemedyError::ShuttingDown)),
                Ok(_) => inner
                    .queue
                    .try_push(item)
                    .err()
                    .map(|item| (item, RemedyError::QueueFull(self.config.max_queue_size))),
            }
        };
        if let Some((item, e)) = rejected {
            self.abandon(item, &e).await;
            return Err(e);
        }
        tracing::info!(item = %id, automation = %automation_id, priority, "automation queued");
        Ok(id)
    }

    /// Terminate an item that never reached the queue, or was taken off it
    /// without running. Items already `queued` are moved to `cancelled`.
    async fn abandon(&self, mut item: QueueItem, error: &RemedyError) {
        item.error = Some(error.to_string());
        let mut status = QueueStatus::Failed;
        if self.states.current_state(&item.id).await == LifecycleState::Queued {
            let context = json!({ "reason": error.to_string() });
            match self
                .states
                .update_state(&item.id, LifecycleState::Cancelled, context)
                .await
            {
                Ok(_) if matches!(error, RemedyError::ShuttingDown) => {
                    status = QueueStatus::Cancelled;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(item = %item.id, error = %e, "could not cancel abandoned item"),
            }
        }
        self.record(item, status);
    }

    /// Cancel a queued item, or a paused one. Running items cannot be
    /// cancelled.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let state = self.states.current_state(id).await;
        match state {
            LifecycleState::Queued | LifecycleState::Paused => {}
            other => {
                return Err(if self.is_known(id) {
                    RemedyError::InvalidTransition {
                        from: other.to_string(),
                        to: LifecycleState::Cancelled.to_string(),
                        reason: "only queued or paused items can be cancelled".into(),
                    }
                } else {
                    RemedyError::ItemNotFound(id.to_string())
                });
            }
        }

        let (queued, parked) = {
            let mut inner = self.lock();
            let queued = inner.queue.remove(id);
            let parked = if queued.is_none() {
                inner.parked.remove(id)
            } else {
                None
            };
            (queued, parked)
        };

        let context = json!({ "reason": "cancelled" });
        let outcome = self
            .states
            .update_state(id, LifecycleState::Cancelled, context)
            .await;

        match (queued, parked, outcome) {
            (Some(item), _, Ok(_)) | (None, Some(Parked::Retry(item)), Ok(_)) => {
                self.record(item, QueueStatus::Cancelled);
            }
            (None, Some(Parked::Finished(item, _)), Ok(_)) => {
                self.record(item, QueueStatus::Cancelled);
            }
            // Paused but still executing: the attempt finishes as cancelled.
            (None, None, Ok(_)) => {}
            (Some(item), _, Err(e)) => {
                let rejected = self.lock().queue.try_push(item).err();
                if let Some(mut item) = rejected {
                    item.error = Some(e.to_string());
                    self.record(item, QueueStatus::Failed);
                }
                return Err(e);
            }
            (None, Some(parked), Err(e)) => {
                self.lock().parked.insert(id.to_string(), parked);
                return Err(e);
            }
            (None, None, Err(e)) => return Err(e),
        }
        tracing::info!(item = %id, "queue item cancelled");
        Ok(())
    }

    /// Pause an item that has started executing. The current attempt runs to
    /// completion; what happens next waits for [`resume`](Self::resume).
    pub async fn pause(&self, id: &str) -> Result<()> {
        if !self.is_known(id) {
            return Err(RemedyError::ItemNotFound(id.to_string()));
        }
        self.states
            .update_state(id, LifecycleState::Paused, json!({ "reason": "paused" }))
            .await?;
        {
            let mut inner = self.lock();
            if let Some(item) = inner.running.get_mut(id) {
                item.status = QueueStatus::Paused;
            }
        }
        tracing::info!(item = %id, "queue item paused");
        Ok(())
    }

    pub async fn resume(self: &Arc<Self>, id: &str) -> Result<()> {
        self.states
            .update_state(id, LifecycleState::Running, json!({ "reason": "resumed" }))
            .await?;
        {
            let mut inner = self.lock();
            if let Some(item) = inner.running.get_mut(id) {
                item.status = QueueStatus::Running;
            }
        }
        tracing::info!(item = %id, "queue item resumed");
        let parked = self.lock().parked.remove(id);
        if let Some(parked) = parked {
            self.clone().release(parked).await;
        }
        Ok(())
    }

    fn is_known(&self, id: &str) -> bool {
        let inner = self.lock();
        inner.queue.contains(id)
            || inner.running.contains_key(id)
            || inner.retrying.contains_key(id)
            || inner.parked.contains_key(id)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Pop as many items as there are free execution slots and dispatch
    /// each on its own task. Returns the dispatched item ids.
    pub fn process_queue(self: &Arc<Self>) -> Vec<String> {
        if self.shutdown.is_cancelled() {
            return Vec::new();
        }
        let batch = {
            let mut inner = self.lock();
            let free = self
                .config
                .max_concurrent
                .saturating_sub(inner.running.len());
            let mut batch = Vec::with_capacity(free);
            while batch.len() < free {
                let Some(mut item) = inner.queue.pop() else {
                    break;
                };
                item.status = QueueStatus::Running;
                inner.running.insert(item.id.clone(), item.clone());
                batch.push(item);
            }
            batch
        };

        let ids: Vec<String> = batch.iter().map(|i| i.id.clone()).collect();
        for item in batch {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.dispatch(item).await });
        }
        ids
    }

    async fn dispatch(self: Arc<Self>, mut item: QueueItem) {
        if item.attempts == 0 {
            let context = json!({ "automation_id": item.automation.id });
            if let Err(e) = self
                .states
                .update_state(&item.id, LifecycleState::Running, context)
                .await
            {
                let status = match self.states.current_state(&item.id).await {
                    LifecycleState::Cancelled => QueueStatus::Cancelled,
                    _ => {
                        item.error = Some(e.to_string());
                        QueueStatus::Failed
                    }
                };
                self.record(item, status);
                return;
            }
            item.started_at = Some(Utc::now());
        } else {
            match self.states.current_state(&item.id).await {
                LifecycleState::Paused => return self.park(Parked::Retry(item)).await,
                LifecycleState::Cancelled => return self.record(item, QueueStatus::Cancelled),
                _ => {}
            }
        }

        item.attempts += 1;
        if let Some(slot) = self.lock().running.get_mut(&item.id) {
            slot.attempts = item.attempts;
            slot.started_at = item.started_at;
        }
        tracing::info!(
            item = %item.id,
            automation = %item.automation.id,
            attempt = item.attempts,
            "dispatching automation"
        );

        let outcome = self.execute_attempt(&item).await;
        self.complete(item, outcome).await;
    }

    async fn execute_attempt(&self, item: &QueueItem) -> Result<Vec<ActionResult>> {
        let worker = self.workers.select(&item.automation)?;
        let context = json!({
            "item_id": item.id,
            "schedule_id": item.schedule_id,
            "attempt": item.attempts,
        });
        let timeout = self.config.worker_timeout();
        let run = AssertUnwindSafe(worker.execute(&item.automation, item.alert.as_ref(), &context))
            .catch_unwind();
        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RemedyError::ActionFailed("worker panicked".into())),
            Err(_) => Err(RemedyError::WorkerTimeout(timeout)),
        }
    }

    async fn complete(self: Arc<Self>, mut item: QueueItem, outcome: Result<Vec<ActionResult>>) {
        match outcome {
            Ok(results) => {
                item.results = results;
                item.error = None;
                self.finish(item, QueueStatus::Completed).await;
            }
            Err(e) => {
                if let RemedyError::WorkflowAborted { results, .. } = &e {
                    item.results = results.clone();
                }
                if e.is_retryable() && item.attempts < self.config.max_retries {
                    self.retry_later(item, e).await;
                } else {
                    let message = if e.is_retryable() {
                        RemedyError::RetryExhausted {
                            attempts: item.attempts,
                            last: e.to_string(),
                        }
                        .to_string()
                    } else {
                        e.to_string()
                    };
                    item.error = Some(message);
                    self.finish(item, QueueStatus::Failed).await;
                }
            }
        }
    }

    async fn retry_later(self: Arc<Self>, mut item: QueueItem, error: RemedyError) {
        let wait = crate::workflow::backoff(self.config.retry_delay(), item.attempts);
        item.error = Some(error.to_string());
        tracing::info!(
            item = %item.id,
            automation = %item.automation.id,
            attempt = item.attempts,
            wait_ms = wait.as_millis() as u64,
            error = %error,
            "retrying automation"
        );
        {
            let mut inner = self.lock();
            inner.running.remove(&item.id);
            inner.retrying.insert(item.id.clone(), item.clone());
        }

        let interrupted = tokio::select! {
            () = tokio::time::sleep(wait) => false,
            () = self.shutdown.cancelled() => true,
        };
        if interrupted {
            item.error = Some(RemedyError::ShuttingDown.to_string());
            return self.finish(item, QueueStatus::Failed).await;
        }

        match self.states.current_state(&item.id).await {
            LifecycleState::Paused => self.park(Parked::Retry(item)).await,
            LifecycleState::Cancelled => self.record(item, QueueStatus::Cancelled),
            _ => self.requeue(item).await,
        }
    }

    async fn requeue(self: Arc<Self>, mut item: QueueItem) {
        if self.shutdown.is_cancelled() {
            item.error = Some(RemedyError::ShuttingDown.to_string());
            return self.finish(item, QueueStatus::Failed).await;
        }
        let rejected = {
            let mut inner = self.lock();
            inner.retrying.remove(&item.id);
            if inner.has_room() {
                inner.queue.try_push(item).err()
            } else {
                Some(item)
            }
        };
        if let Some(mut item) = rejected {
            tracing::warn!(item = %item.id, "queue full, retry dropped");
            item.error = Some(
                RemedyError::RetryExhausted {
                    attempts: item.attempts,
                    last: RemedyError::QueueFull(self.config.max_queue_size).to_string(),
                }
                .to_string(),
            );
            self.finish(item, QueueStatus::Failed).await;
        }
    }

    /// Commit the terminal transition and record the item. Boxed because a
    /// paused item parks here and is finished again on resume.
    fn finish(self: Arc<Self>, mut item: QueueItem, status: QueueStatus) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let target = match status {
                QueueStatus::Completed => LifecycleState::Completed,
                _ => LifecycleState::Failed,
            };
            let context = json!({ "attempts": item.attempts, "error": item.error });
            match self.states.update_state(&item.id, target, context).await {
                Ok(_) => self.record(item, status),
                Err(e) => match self.states.current_state(&item.id).await {
                    LifecycleState::Paused => {
                        item.status = QueueStatus::Paused;
                        self.park(Parked::Finished(item, status)).await;
                    }
                    LifecycleState::Cancelled => self.record(item, QueueStatus::Cancelled),
                    _ => {
                        tracing::warn!(item = %item.id, error = %e, "terminal transition rejected");
                        self.record(item, status);
                    }
                },
            }
        })
    }

    async fn park(self: Arc<Self>, parked: Parked) {
        let id = parked.item().id.clone();
        {
            let mut inner = self.lock();
            inner.running.remove(&id);
            inner.retrying.remove(&id);
            inner.parked.insert(id.clone(), parked);
        }
        tracing::info!(item = %id, "paused item parked");
        // A resume may have landed between the failed transition and the
        // insert above; whoever removes the entry releases it.
        if self.states.current_state(&id).await != LifecycleState::Paused {
            let parked = self.lock().parked.remove(&id);
            if let Some(parked) = parked {
                self.release(parked).await;
            }
        }
    }

    async fn release(self: Arc<Self>, parked: Parked) {
        match parked {
            Parked::Finished(item, status) => self.finish(item, status).await,
            Parked::Retry(mut item) => {
                item.status = QueueStatus::Queued;
                self.lock()
                    .retrying
                    .insert(item.id.clone(), item.clone());
                self.requeue(item).await;
            }
        }
    }

    fn record(&self, mut item: QueueItem, status: QueueStatus) {
        item.status = status;
        item.finished_at = Some(Utc::now());
        match status {
            QueueStatus::Completed => tracing::info!(
                item = %item.id,
                automation = %item.automation.id,
                attempts = item.attempts,
                "automation completed"
            ),
            QueueStatus::Cancelled => tracing::info!(item = %item.id, "automation cancelled"),
            _ => tracing::warn!(
                item = %item.id,
                automation = %item.automation.id,
                attempts = item.attempts,
                error = item.error.as_deref().unwrap_or(""),
                "automation failed"
            ),
        }

        let mut inner = self.lock();
        inner.running.remove(&item.id);
        inner.retrying.remove(&item.id);
        match status {
            QueueStatus::Completed => inner.completed += 1,
            QueueStatus::Cancelled => inner.cancelled += 1,
            _ => inner.failed += 1,
        }
        inner.history.push_back(item);
        while inner.history.len() > self.config.max_history {
            inner.history.pop_front();
        }
    }

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    pub fn schedule_automation(
        &self,
        automation: Arc<Automation>,
        config: ScheduleConfig,
    ) -> Result<Schedule> {
        self.schedule_automation_at(automation, config, Utc::now())
    }

    pub fn schedule_automation_at(
        &self,
        automation: Arc<Automation>,
        config: ScheduleConfig,
        now: DateTime<Utc>,
    ) -> Result<Schedule> {
        config.validate()?;
        if config.automation_id != automation.id {
            return Err(RemedyError::Validation(format!(
                "schedule targets '{}' but automation is '{}'",
                config.automation_id, automation.id
            )));
        }
        if config.frequency == Frequency::Cron {
            tracing::warn!(
                automation = %automation.id,
                cron = config.cron.as_deref().unwrap_or(""),
                "cron expressions are not evaluated, firing hourly"
            );
        }
        let schedule = Schedule {
            id: Uuid::new_v4().to_string(),
            automation_id: automation.id.clone(),
            frequency: config.frequency,
            interval: config.interval,
            priority: config.priority,
            cron: config.cron,
            status: ScheduleStatus::Scheduled,
            next_run: config
                .start_at
                .unwrap_or_else(|| config.frequency.next_run(now, config.interval)),
            last_run: None,
            runs: 0,
            created_at: now,
        };
        tracing::info!(
            schedule = %schedule.id,
            automation = %automation.id,
            frequency = %schedule.frequency,
            next_run = %schedule.next_run,
            "automation scheduled"
        );
        self.lock_schedules().push(ScheduleEntry {
            schedule: schedule.clone(),
            automation,
        });
        Ok(schedule)
    }

    fn with_schedule<T>(&self, id: &str, f: impl FnOnce(&mut ScheduleEntry) -> T) -> Result<T> {
        let mut schedules = self.lock_schedules();
        schedules
            .iter_mut()
            .find(|e| e.schedule.id == id)
            .map(f)
            .ok_or_else(|| RemedyError::ScheduleNotFound(id.to_string()))
    }

    pub fn pause_schedule(&self, id: &str) -> Result<Schedule> {
        self.with_schedule(id, |e| {
            e.schedule.status = ScheduleStatus::Paused;
            e.schedule.clone()
        })
    }

    /// Reactivate a paused schedule. A `next_run` already in the past is
    /// moved one period past `now`.
    pub fn resume_schedule_at(&self, id: &str, now: DateTime<Utc>) -> Result<Schedule> {
        self.with_schedule(id, |e| {
            e.schedule.status = ScheduleStatus::Scheduled;
            if e.schedule.next_run < now {
                e.schedule.next_run = e.schedule.frequency.next_run(now, e.schedule.interval);
            }
            e.schedule.clone()
        })
    }

    pub fn resume_schedule(&self, id: &str) -> Result<Schedule> {
        self.resume_schedule_at(id, Utc::now())
    }

    pub fn delete_schedule(&self, id: &str) -> Result<Schedule> {
        let mut schedules = self.lock_schedules();
        let pos = schedules
            .iter()
            .position(|e| e.schedule.id == id)
            .ok_or_else(|| RemedyError::ScheduleNotFound(id.to_string()))?;
        Ok(schedules.remove(pos).schedule)
    }

    pub fn get_schedules(&self, filter: &ScheduleFilter) -> Vec<Schedule> {
        self.lock_schedules()
            .iter()
            .filter(|e| filter.matches(&e.schedule))
            .map(|e| e.schedule.clone())
            .collect()
    }

    /// Point every schedule of `automation.id` at the new definition.
    pub fn replace_automation(&self, automation: &Arc<Automation>) {
        for entry in self
            .lock_schedules()
            .iter_mut()
            .filter(|e| e.schedule.automation_id == automation.id)
        {
            entry.automation = Arc::clone(automation);
        }
    }

    /// Enqueue every due schedule and advance its `next_run`. Returns the
    /// ids of the queued items; rejected runs are logged and land in the
    /// history as failed.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let due: Vec<(Arc<Automation>, Schedule)> = self
            .lock_schedules()
            .iter_mut()
            .filter(|e| e.schedule.is_due(now))
            .map(|e| {
                e.schedule.advance(now);
                (Arc::clone(&e.automation), e.schedule.clone())
            })
            .collect();

        let mut queued = Vec::with_capacity(due.len());
        for (automation, schedule) in due {
            let priority = schedule.priority.unwrap_or(self.config.default_priority);
            let mut item = QueueItem::new(automation, priority, None);
            item.schedule_id = Some(schedule.id.clone());
            match self.enqueue(item).await {
                Ok(id) => queued.push(id),
                Err(e) => tracing::warn!(
                    schedule = %schedule.id,
                    automation = %schedule.automation_id,
                    error = %e,
                    "scheduled run not queued"
                ),
            }
        }
        if !queued.is_empty() {
            tracing::debug!(count = queued.len(), "schedule tick queued runs");
        }
        queued
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Queued items in pop order.
    pub fn get_queue(&self) -> Vec<QueueItem> {
        self.lock().queue.snapshot()
    }

    pub fn get_running(&self) -> Vec<QueueItem> {
        let mut items: Vec<QueueItem> = self.lock().running.values().cloned().collect();
        items.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        items
    }

    /// Items between attempts, or parked while paused.
    pub fn get_waiting(&self) -> Vec<QueueItem> {
        let inner = self.lock();
        let mut items: Vec<QueueItem> = inner
            .retrying
            .values()
            .cloned()
            .chain(inner.parked.values().map(|p| p.item().clone()))
            .collect();
        items.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        items
    }

    pub fn get_history(&self, filter: &QueueHistoryFilter) -> Vec<QueueItem> {
        let inner = self.lock();
        inner
            .history
            .iter()
            .rev()
            .filter(|i| filter.status.map_or(true, |s| i.status == s))
            .filter(|i| {
                filter
                    .automation_id
                    .as_deref()
                    .map_or(true, |id| i.automation.id == id)
            })
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let schedules = self.lock_schedules().len();
        let inner = self.lock();
        SchedulerStats {
            queued: inner.queue.len(),
            running: inner.running.len(),
            retrying: inner.retrying.len(),
            parked: inner.parked.len(),
            completed: inner.completed,
            failed: inner.failed,
            cancelled: inner.cancelled,
            schedules,
        }
    }

    /// Nothing queued, executing or waiting on a retry. Parked items do not
    /// count: they wait on an operator.
    pub fn is_idle(&self) -> bool {
        let inner = self.lock();
        inner.queue.is_empty()
            && inner.running.is_empty()
            && inner.retrying.is_empty()
            && inner.reserved == 0
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    /// Stop dispatching and new enqueues. Items still in the queue are
    /// cancelled with [`RemedyError::ShuttingDown`] as their error, items
    /// sleeping before a retry fail with it, and in-flight attempts run to
    /// completion.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let pending: Vec<QueueItem> = {
            let mut inner = self.lock();
            std::iter::from_fn(|| inner.queue.pop()).collect()
        };
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "cancelling queued items on shutdown");
        }
        for item in pending {
            self.abandon(item, &RemedyError::ShuttingDown).await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Spawn the schedule ticker and the queue processor. Both stop when
    /// `token` is cancelled, after which the scheduler shuts down.
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let ticker = {
            let this = Arc::clone(self);
            let token = token.clone();
            tokio::spawn(async move {
                let period = this.config.tick_interval().max(Duration::from_millis(1));
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                tracing::info!(period_secs = period.as_secs(), "schedule ticker started");
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = interval.tick() => {
                            this.tick_at(Utc::now()).await;
                        }
                    }
                }
                tracing::info!("schedule ticker stopped");
            })
        };

        let processor = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let period = this.config.queue_interval().max(Duration::from_millis(1));
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                tracing::info!(period_ms = period.as_millis() as u64, "queue processor started");
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = interval.tick() => {
                            this.process_queue();
                        }
                    }
                }
                this.shutdown().await;
                tracing::info!("queue processor stopped");
            })
        };

        vec![ticker, processor]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
