//! Alert-driven remediation: mine recurring alert patterns, match alerts
//! against registered automations, and run their workflows directly or
//! through a prioritized, retrying scheduler.

pub mod action;
pub mod alert;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod io;
pub mod metrics;
pub mod pattern;
pub mod rules;
pub mod scheduler;
pub mod state;
pub mod types;
pub mod workflow;

pub use action::{Action, ActionOutcome, ActionRegistry, ActionResult, WorkflowStep};
pub use alert::Alert;
pub use condition::Condition;
pub use config::Config;
pub use engine::{Engine, HistoryEntry, HistoryFilter, RejectedMatch, RoutedAlert};
pub use error::{RemedyError, Result};
pub use pattern::{PatternDetector, PatternReport};
pub use rules::{Automation, AutomationSpec, RuleMatcher};
pub use scheduler::Scheduler;
pub use state::StateManager;
pub use types::{LifecycleState, Priority, QueueStatus};
pub use workflow::WorkflowExecutor;
