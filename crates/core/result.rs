//! Stored task results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{current_timestamp, Job, JobId};

/// State recorded for a finished delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// The handler returned a value.
    Success,
    /// The handler failed and another delivery is scheduled.
    Retry,
    /// The handler failed permanently.
    Failure,
}

/// What the result store keeps for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub job_id: JobId,
    pub task: String,
    pub state: TaskState,
    /// Handler return value on success.
    pub result: Option<Value>,
    /// Error message on retry or failure.
    pub error: Option<String>,
    pub retries: u32,
    /// Unix timestamp in seconds.
    pub date_done: i64,
}

impl TaskOutcome {
    /// Outcome of a successful delivery.
    pub fn success(job: &Job, value: Value) -> Self {
        Self::new(job, TaskState::Success, Some(value), None)
    }

    /// Outcome of a delivery that will be retried.
    pub fn retry(job: &Job, error: impl Into<String>) -> Self {
        Self::new(job, TaskState::Retry, None, Some(error.into()))
    }

    /// Outcome of a delivery that was dead-lettered.
    pub fn failure(job: &Job, error: impl Into<String>) -> Self {
        Self::new(job, TaskState::Failure, None, Some(error.into()))
    }

    fn new(job: &Job, state: TaskState, result: Option<Value>, error: Option<String>) -> Self {
        Self {
            job_id: job.id.clone(),
            task: job.name.clone(),
            state,
            result,
            error,
            retries: job.retries,
            date_done: current_timestamp(),
        }
    }

    /// Whether the job reached a final state.
    pub fn is_ready(&self) -> bool {
        self.state != TaskState::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_wire_names() {
        assert_eq!(serde_json::to_string(&TaskState::Success).unwrap(), "\"SUCCESS\"");
        assert_eq!(serde_json::to_string(&TaskState::Failure).unwrap(), "\"FAILURE\"");
    }

    #[test]
    fn test_success_outcome() {
        let job = Job::new("tasks.simple_task", json!({"message": "hi"}));
        let outcome = TaskOutcome::success(&job, json!("Processed: hi"));
        assert_eq!(outcome.job_id, job.id);
        assert_eq!(outcome.state, TaskState::Success);
        assert_eq!(outcome.result, Some(json!("Processed: hi")));
        assert!(outcome.is_ready());
    }

    #[test]
    fn test_retry_outcome_is_not_ready() {
        let job = Job::new("tasks.task_with_retry", json!({"url": "http://x"}));
        let outcome = TaskOutcome::retry(&job, "connection refused");
        assert_eq!(outcome.error.as_deref(), Some("connection refused"));
        assert!(!outcome.is_ready());
    }
}
