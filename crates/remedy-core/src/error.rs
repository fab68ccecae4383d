use crate::action::ActionResult;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemedyError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("unknown action type: {0}")]
    UnknownAction(String),

    #[error("no worker found for automation type '{0}'")]
    NoWorkerFound(String),

    #[error("workflow aborted: required step {index} ('{step}') failed")]
    WorkflowAborted {
        step: String,
        index: usize,
        /// Results of every step that ran, including the failed one.
        results: Vec<ActionResult>,
    },

    #[error("queue is full (max {0} items)")]
    QueueFull(usize),

    #[error("worker timed out after {0:?}")]
    WorkerTimeout(Duration),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },

    #[error("action failed: {0}")]
    ActionFailed(String),

    #[error("automation not found: {0}")]
    AutomationNotFound(String),

    #[error("automation '{id}' is referenced by schedules: {schedules}")]
    AutomationInUse { id: String, schedules: String },

    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("queue item not found: {0}")]
    ItemNotFound(String),

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RemedyError {
    /// Whether a queue item or workflow may be retried after this error.
    /// Every execution-time failure is, except a missing action or worker
    /// registration and shutdown.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RemedyError::UnknownAction(_) | RemedyError::NoWorkerFound(_) | RemedyError::ShuttingDown
        )
    }
}

pub type Result<T> = std::result::Result<T, RemedyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(RemedyError::WorkerTimeout(Duration::from_secs(1)).is_retryable());
        assert!(RemedyError::ActionFailed("boom".into()).is_retryable());
        assert!(!RemedyError::UnknownAction("page".into()).is_retryable());
        assert!(!RemedyError::NoWorkerFound("default".into()).is_retryable());
        assert!(!RemedyError::ShuttingDown.is_retryable());
        assert!(RemedyError::Validation("bad payload".into()).is_retryable());
        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(RemedyError::from(json).is_retryable());
    }

    #[test]
    fn transition_error_message_names_both_states() {
        let e = RemedyError::InvalidTransition {
            from: "running".into(),
            to: "running".into(),
            reason: "no such edge".into(),
        };
        assert_eq!(
            e.to_string(),
            "invalid transition from running to running: no such edge"
        );
    }
}
