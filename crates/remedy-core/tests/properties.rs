use chrono::Utc;
use proptest::prelude::*;
use remedy_core::action::WorkflowStep;
use remedy_core::config::{SchedulerConfig, StateConfig};
use remedy_core::{Automation, LifecycleState, RemedyError, Scheduler, StateManager};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

const STATES: usize = 6;

fn node(i: usize) -> LifecycleState {
    LifecycleState::from(format!("s{i}").as_str())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn automation() -> Arc<Automation> {
    Arc::new(Automation {
        id: "prop".into(),
        name: "prop".into(),
        kind: "default".into(),
        conditions: vec![],
        workflow: vec![WorkflowStep::new("log", true)],
        enabled: true,
        created_at: Utc::now(),
    })
}

proptest! {
    #[test]
    fn update_state_only_follows_registered_edges(
        edges in prop::collection::hash_set((0..STATES, 0..STATES), 0..20),
        walk in prop::collection::vec(0..STATES, 1..30),
    ) {
        let sm = StateManager::new(StateConfig::default());
        // Instances start in `created`; give it a way into the graph.
        sm.register_transition(LifecycleState::Created, node(0), None);
        for (from, to) in &edges {
            sm.register_transition(node(*from), node(*to), None);
        }
        let allowed: HashSet<(LifecycleState, LifecycleState)> = edges
            .iter()
            .map(|(f, t)| (node(*f), node(*t)))
            .chain(std::iter::once((LifecycleState::Created, node(0))))
            .collect();

        let rt = runtime();
        rt.block_on(async {
            for target in walk {
                let target = node(target);
                let before = sm.current_state("i").await;
                let outcome = sm.update_state("i", target.clone(), Value::Null).await;
                let permitted = allowed.contains(&(before.clone(), target.clone()));
                prop_assert_eq!(outcome.is_ok(), permitted);
                let after = sm.current_state("i").await;
                if permitted {
                    prop_assert_eq!(after, target);
                } else {
                    let is_invalid = matches!(outcome, Err(RemedyError::InvalidTransition { .. }));
                    prop_assert!(is_invalid);
                    prop_assert_eq!(after, before);
                }
            }
            Ok(())
        })?;
    }

    #[test]
    fn queue_never_exceeds_capacity(capacity in 1usize..16, extra in 0usize..16) {
        let states = Arc::new(StateManager::with_lifecycle(StateConfig::default()));
        let scheduler = Scheduler::new(
            SchedulerConfig {
                max_queue_size: capacity,
                ..SchedulerConfig::default()
            },
            states,
        );

        let rt = runtime();
        rt.block_on(async {
            for n in 0..capacity + extra {
                let outcome = scheduler.queue_automation(automation(), 1, None).await;
                if n < capacity {
                    prop_assert!(outcome.is_ok());
                } else {
                    let is_full = matches!(outcome, Err(RemedyError::QueueFull(c)) if c == capacity);
                    prop_assert!(is_full);
                }
                prop_assert!(scheduler.get_queue().len() <= capacity);
            }
            prop_assert_eq!(scheduler.get_queue().len(), capacity);
            Ok(())
        })?;
    }
}
