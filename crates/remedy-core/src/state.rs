//! Lifecycle state machine for automation instances.
//!
//! Every queue item and every directly executed automation run is an
//! instance tracked here. Transitions must follow a registered edge; an edge
//! may carry an async validator that gets the final say. Listeners observe
//! committed transitions and cannot undo them.

use crate::config::StateConfig;
use crate::error::{RemedyError, Result};
use crate::types::LifecycleState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: String,
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<LifecycleState>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
    pub timestamp: DateTime<Utc>,
}

/// A committed transition plus any listener failures it produced.
#[derive(Debug, Clone)]
pub struct Transition {
    pub record: StateRecord,
    pub listener_failures: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub instances: usize,
    pub history: usize,
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Guards a single edge. Returning an error rejects the transition.
#[async_trait]
pub trait TransitionValidator: Send + Sync {
    async fn validate(
        &self,
        id: &str,
        from: &LifecycleState,
        to: &LifecycleState,
        context: &Value,
    ) -> Result<()>;
}

#[async_trait]
pub trait StateListener: Send + Sync {
    async fn on_transition(&self, record: &StateRecord) -> Result<()>;
}

type Edges = HashMap<LifecycleState, Option<Arc<dyn TransitionValidator>>>;

#[derive(Default)]
struct Graph {
    states: HashSet<LifecycleState>,
    terminal: HashSet<LifecycleState>,
    edges: HashMap<LifecycleState, Edges>,
}

#[derive(Default)]
struct Instances {
    current: HashMap<String, StateRecord>,
    history: VecDeque<StateRecord>,
}

// ---------------------------------------------------------------------------
// StateManager
// ---------------------------------------------------------------------------

pub struct StateManager {
    config: StateConfig,
    graph: RwLock<Graph>,
    listeners: RwLock<Vec<Arc<dyn StateListener>>>,
    /// Never held across a validator or listener call.
    instances: Mutex<Instances>,
    /// One lock per instance id; serializes that instance's transitions.
    gates: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StateManager {
    /// An empty machine: no states, no edges.
    pub fn new(config: StateConfig) -> Self {
        Self {
            config,
            graph: RwLock::new(Graph::default()),
            listeners: RwLock::new(Vec::new()),
            instances: Mutex::new(Instances::default()),
            gates: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The built-in lifecycle:
    ///
    /// ```text
    /// created   -> scheduled | queued
    /// scheduled -> queued
    /// queued    -> running | cancelled
    /// running   -> completed | failed | paused
    /// paused    -> running | cancelled
    /// ```
    pub fn with_lifecycle(config: StateConfig) -> Self {
        use LifecycleState::*;
        let manager = Self::new(config);
        for state in LifecycleState::builtin() {
            let terminal = matches!(state, Completed | Failed | Cancelled);
            manager.register_state(state.clone(), terminal);
        }
        let edges = [
            (Created, Scheduled),
            (Created, Queued),
            (Scheduled, Queued),
            (Queued, Running),
            (Queued, Cancelled),
            (Running, Completed),
            (Running, Failed),
            (Running, Paused),
            (Paused, Running),
            (Paused, Cancelled),
        ];
        for (from, to) in edges {
            manager.register_transition(from, to, None);
        }
        manager
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn register_state(&self, state: LifecycleState, terminal: bool) {
        let mut graph = self.graph.write().unwrap_or_else(|e| e.into_inner());
        if terminal {
            graph.terminal.insert(state.clone());
        } else {
            graph.terminal.remove(&state);
        }
        graph.states.insert(state);
    }

    /// Add (or replace) the edge `from -> to`. Unknown states are registered
    /// as non-terminal.
    pub fn register_transition(
        &self,
        from: LifecycleState,
        to: LifecycleState,
        validator: Option<Arc<dyn TransitionValidator>>,
    ) {
        let mut graph = self.graph.write().unwrap_or_else(|e| e.into_inner());
        graph.states.insert(from.clone());
        graph.states.insert(to.clone());
        graph.edges.entry(from).or_default().insert(to, validator);
    }

    pub fn add_listener(&self, listener: Arc<dyn StateListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn is_terminal(&self, state: &LifecycleState) -> bool {
        self.graph
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .terminal
            .contains(state)
    }

    pub fn registered_states(&self) -> Vec<LifecycleState> {
        let mut states: Vec<LifecycleState> = self
            .graph
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .states
            .iter()
            .cloned()
            .collect();
        states.sort();
        states
    }

    pub fn can_transition(&self, from: &LifecycleState, to: &LifecycleState) -> bool {
        self.graph
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .edges
            .get(from)
            .is_some_and(|e| e.contains_key(to))
    }

    fn gate(&self, id: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(gates.entry(id.to_string()).or_default())
    }

    /// Move instance `id` to `to`.
    ///
    /// Transitions of one instance are serialized; different instances
    /// never wait on each other. The edge validator runs without the
    /// instance table locked, so it may read the machine, but it must not
    /// transition the instance it is validating. Listeners run after the
    /// commit and their failures, panics included, are reported in
    /// [`Transition::listener_failures`].
    pub async fn update_state(
        &self,
        id: &str,
        to: LifecycleState,
        context: Value,
    ) -> Result<Transition> {
        let gate = self.gate(id);
        let serial = gate.lock().await;
        let from = self.current_state(id).await;

        let edge = self
            .graph
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .edges
            .get(&from)
            .and_then(|edges| edges.get(&to).cloned());

        let validator = match edge {
            Some(validator) => validator,
            None if self.config.validate_transitions => {
                return Err(RemedyError::InvalidTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                    reason: "no such transition registered".into(),
                });
            }
            None => None,
        };

        if let Some(validator) = validator {
            if let Err(e) = validator.validate(id, &from, &to, &context).await {
                tracing::debug!(instance = %id, %from, %to, error = %e, "transition rejected");
                return Err(RemedyError::InvalidTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        let record = StateRecord {
            id: id.to_string(),
            state: to,
            previous: Some(from),
            context,
            timestamp: Utc::now(),
        };
        {
            let mut instances = self.instances.lock().await;
            instances.current.insert(id.to_string(), record.clone());
            instances.history.push_back(record.clone());
            while instances.history.len() > self.config.max_history {
                instances.history.pop_front();
            }
        }
        drop(serial);

        tracing::debug!(
            instance = %id,
            from = record.previous.as_ref().map(LifecycleState::as_str).unwrap_or("created"),
            to = %record.state,
            "state transition"
        );

        let listener_failures = self.notify(&record).await;
        Ok(Transition {
            record,
            listener_failures,
        })
    }

    async fn notify(&self, record: &StateRecord) -> Vec<String> {
        let listeners: Vec<Arc<dyn StateListener>> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let outcomes = futures::future::join_all(
            listeners
                .iter()
                .map(|l| AssertUnwindSafe(l.on_transition(record)).catch_unwind()),
        )
        .await;
        outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(format!("listener panicked: {}", panic_message(&*panic))),
            })
            .map(|failure| {
                tracing::warn!(instance = %record.id, state = %record.state, error = %failure, "state listener failed");
                failure
            })
            .collect()
    }

    /// Current state of `id`; unseen instances are `created`.
    pub async fn current_state(&self, id: &str) -> LifecycleState {
        self.instances
            .lock()
            .await
            .current
            .get(id)
            .map(|r| r.state.clone())
            .unwrap_or(LifecycleState::Created)
    }

    /// Latest record of every tracked instance, sorted by id.
    pub async fn get_states(&self) -> Vec<StateRecord> {
        let mut states: Vec<StateRecord> =
            self.instances.lock().await.current.values().cloned().collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    /// Transition history of one instance, oldest first.
    pub async fn history(&self, id: &str) -> Vec<StateRecord> {
        self.instances
            .lock()
            .await
            .history
            .iter()
            .filter(|r| r.id == id)
            .cloned()
            .collect()
    }

    /// Purge records older than the retention window, but only for instances
    /// whose current state is terminal. Active instances are kept regardless
    /// of age.
    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let cutoff = now - self.config.history_retention();
        let terminal = self
            .graph
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .terminal
            .clone();

        let mut instances = self.instances.lock().await;
        let expired: HashSet<String> = instances
            .current
            .values()
            .filter(|r| terminal.contains(&r.state) && r.timestamp < cutoff)
            .map(|r| r.id.clone())
            .collect();
        for id in &expired {
            instances.current.remove(id);
        }
        {
            let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
            for id in &expired {
                if gates.get(id).is_some_and(|g| Arc::strong_count(g) == 1) {
                    gates.remove(id);
                }
            }
        }

        let before = instances.history.len();
        let Instances { current, history } = &mut *instances;
        history.retain(|r| {
            let finished = match current.get(&r.id) {
                Some(latest) => terminal.contains(&latest.state),
                None => true,
            };
            !(finished && r.timestamp < cutoff)
        });
        let report = CleanupReport {
            instances: expired.len(),
            history: before - history.len(),
        };
        if report.instances > 0 || report.history > 0 {
            tracing::info!(
                instances = report.instances,
                history = report.history,
                "state cleanup"
            );
        }
        report
    }

    pub async fn cleanup(&self) -> CleanupReport {
        self.cleanup_at(Utc::now()).await
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lifecycle() -> StateManager {
        StateManager::with_lifecycle(StateConfig::default())
    }

    struct Deny;

    #[async_trait]
    impl TransitionValidator for Deny {
        async fn validate(
            &self,
            _: &str,
            _: &LifecycleState,
            _: &LifecycleState,
            _: &Value,
        ) -> Result<()> {
            Err(RemedyError::Validation("maintenance window".into()))
        }
    }

    struct Recorder {
        seen: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl StateListener for Recorder {
        async fn on_transition(&self, _: &StateRecord) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(RemedyError::ActionFailed("listener down".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn happy_path_through_lifecycle() {
        use LifecycleState::*;
        let sm = lifecycle();
        for state in [Queued, Running, Paused, Running, Completed] {
            sm.update_state("job-1", state, Value::Null).await.unwrap();
        }
        assert_eq!(sm.current_state("job-1").await, Completed);
        let history = sm.history("job-1").await;
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].previous, Some(Created));
        assert!(sm.is_terminal(&Completed));
        assert!(!sm.is_terminal(&Paused));
    }

    #[tokio::test]
    async fn missing_edge_is_rejected_without_side_effects() {
        let sm = lifecycle();
        sm.update_state("j", LifecycleState::Queued, Value::Null)
            .await
            .unwrap();
        let err = sm
            .update_state("j", LifecycleState::Completed, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RemedyError::InvalidTransition { ref from, ref to, .. } if from == "queued" && to == "completed"
        ));
        assert_eq!(sm.current_state("j").await, LifecycleState::Queued);
        assert_eq!(sm.history("j").await.len(), 1);
    }

    #[tokio::test]
    async fn validator_can_veto() {
        let sm = lifecycle();
        sm.register_transition(
            LifecycleState::Created,
            LifecycleState::Queued,
            Some(Arc::new(Deny)),
        );
        let err = sm
            .update_state("j", LifecycleState::Queued, Value::Null)
            .await
            .unwrap_err();
        match err {
            RemedyError::InvalidTransition { reason, .. } => {
                assert!(reason.contains("maintenance window"))
            }
            other => panic!("unexpected: {other}"),
        }
        assert!(sm.get_states().await.is_empty());
    }

    #[tokio::test]
    async fn failing_listener_does_not_block_others() {
        let sm = lifecycle();
        let bad = Arc::new(Recorder {
            seen: AtomicUsize::new(0),
            fail: true,
        });
        let good = Arc::new(Recorder {
            seen: AtomicUsize::new(0),
            fail: false,
        });
        sm.add_listener(bad.clone());
        sm.add_listener(good.clone());

        let t = sm
            .update_state("j", LifecycleState::Queued, Value::Null)
            .await
            .unwrap();
        assert_eq!(t.listener_failures.len(), 1);
        assert_eq!(bad.seen.load(Ordering::SeqCst), 1);
        assert_eq!(good.seen.load(Ordering::SeqCst), 1);
        assert_eq!(sm.current_state("j").await, LifecycleState::Queued);

        sm.update_state("j", LifecycleState::Running, Value::Null)
            .await
            .unwrap();
        assert_eq!(bad.seen.load(Ordering::SeqCst), 2);
    }

    struct Panics;

    #[async_trait]
    impl StateListener for Panics {
        async fn on_transition(&self, record: &StateRecord) -> Result<()> {
            panic!("listener blew up on {}", record.state);
        }
    }

    #[tokio::test]
    async fn panicking_listener_is_reported_not_propagated() {
        let sm = lifecycle();
        let good = Arc::new(Recorder {
            seen: AtomicUsize::new(0),
            fail: false,
        });
        sm.add_listener(Arc::new(Panics));
        sm.add_listener(good.clone());

        let t = sm
            .update_state("j", LifecycleState::Queued, Value::Null)
            .await
            .unwrap();
        assert_eq!(t.listener_failures.len(), 1);
        assert!(t.listener_failures[0].contains("listener blew up on queued"));
        assert_eq!(good.seen.load(Ordering::SeqCst), 1);
        assert_eq!(sm.current_state("j").await, LifecycleState::Queued);
    }

    /// Allows a transition only once `upstream` has completed.
    struct AfterUpstream {
        states: Arc<StateManager>,
    }

    #[async_trait]
    impl TransitionValidator for AfterUpstream {
        async fn validate(
            &self,
            _: &str,
            _: &LifecycleState,
            _: &LifecycleState,
            _: &Value,
        ) -> Result<()> {
            match self.states.current_state("upstream").await {
                LifecycleState::Completed => Ok(()),
                other => Err(RemedyError::Validation(format!("upstream is {other}"))),
            }
        }
    }

    #[tokio::test]
    async fn validator_may_read_other_instances() {
        use LifecycleState::*;
        let sm = Arc::new(lifecycle());
        sm.register_transition(
            Queued,
            Running,
            Some(Arc::new(AfterUpstream {
                states: Arc::clone(&sm),
            })),
        );
        sm.update_state("job", Queued, Value::Null).await.unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            sm.update_state("job", Running, Value::Null),
        )
        .await
        .expect("validator must not deadlock");
        assert!(matches!(blocked, Err(RemedyError::InvalidTransition { ref reason, .. }) if reason.contains("upstream is created")));

        sm.register_transition(Queued, Completed, None);
        sm.update_state("upstream", Queued, Value::Null).await.unwrap();
        sm.update_state("upstream", Completed, Value::Null).await.unwrap();
        sm.update_state("job", Running, Value::Null).await.unwrap();
        assert_eq!(sm.current_state("job").await, Running);
    }

    /// Holds the transition until released.
    struct Hold(Arc<tokio::sync::Notify>);

    #[async_trait]
    impl TransitionValidator for Hold {
        async fn validate(
            &self,
            _: &str,
            _: &LifecycleState,
            _: &LifecycleState,
            _: &Value,
        ) -> Result<()> {
            self.0.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_validator_only_blocks_its_own_instance() {
        use LifecycleState::*;
        let release = Arc::new(tokio::sync::Notify::new());
        let sm = Arc::new(lifecycle());
        sm.register_transition(Queued, Running, Some(Arc::new(Hold(Arc::clone(&release)))));
        sm.update_state("held", Queued, Value::Null).await.unwrap();

        let pending = {
            let sm = Arc::clone(&sm);
            tokio::spawn(async move { sm.update_state("held", Running, Value::Null).await })
        };
        tokio::task::yield_now().await;

        let free = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            sm.update_state("free", Queued, Value::Null),
        )
        .await
        .expect("other instances must not wait on the validator");
        assert!(free.is_ok());
        assert_eq!(sm.current_state("held").await, Queued);
        assert_eq!(sm.get_states().await.len(), 2);

        release.notify_one();
        pending.await.unwrap().unwrap();
        assert_eq!(sm.current_state("held").await, Running);
    }

    #[tokio::test]
    async fn custom_states_and_unvalidated_mode() {
        let custom = LifecycleState::from("awaiting_approval");
        let sm = lifecycle();
        sm.register_state(custom.clone(), false);
        sm.register_transition(LifecycleState::Created, custom.clone(), None);
        sm.update_state("j", custom.clone(), Value::Null).await.unwrap();
        assert!(sm.registered_states().contains(&custom));

        let loose = StateManager::with_lifecycle(StateConfig {
            validate_transitions: false,
            ..StateConfig::default()
        });
        loose
            .update_state("j", LifecycleState::Completed, Value::Null)
            .await
            .unwrap();
        assert_eq!(loose.current_state("j").await, LifecycleState::Completed);
    }

    #[tokio::test]
    async fn cleanup_only_purges_old_terminal_instances() {
        use LifecycleState::*;
        let sm = lifecycle();
        for state in [Queued, Running, Completed] {
            sm.update_state("done", state, Value::Null).await.unwrap();
        }
        for state in [Queued, Running] {
            sm.update_state("active", state, Value::Null).await.unwrap();
        }

        let report = sm.cleanup_at(Utc::now()).await;
        assert_eq!(report, CleanupReport::default());

        let later = Utc::now() + chrono::Duration::days(30);
        let report = sm.cleanup_at(later).await;
        assert_eq!(report.instances, 1);
        assert_eq!(report.history, 3);
        assert!(sm.history("done").await.is_empty());
        assert_eq!(sm.current_state("active").await, Running);
        assert_eq!(sm.history("active").await.len(), 2);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let sm = StateManager::with_lifecycle(StateConfig {
            max_history: 3,
            ..StateConfig::default()
        });
        for i in 0..5 {
            sm.update_state(&format!("j{i}"), LifecycleState::Queued, Value::Null)
                .await
                .unwrap();
        }
        assert!(sm.history("j0").await.is_empty());
        assert_eq!(sm.history("j4").await.len(), 1);
        assert_eq!(sm.get_states().await.len(), 5);
    }
}
