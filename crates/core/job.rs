//! Job invocation record and related types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Content type of every payload courier produces.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Unique identifier for a job invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new random JobId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a JobId from its hyphenated string form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job is pending execution.
    Pending,
    /// Job is waiting for its ETA.
    Scheduled,
    /// Job failed and is queued for retry.
    Retry,
    /// Job failed permanently and was dead-lettered.
    Dead,
}

/// A single invocation of a registered task.
///
/// The record travels through the broker as JSON. Workers resolve the
/// execution policy from the registry by `name`; only the retry count and
/// (on explicit retry) the arguments change between deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// Registered task name.
    pub name: String,
    /// Keyword arguments as a JSON object.
    pub args: Value,
    /// Number of retries already performed.
    pub retries: u32,
    /// Current job status.
    pub status: JobStatus,
    /// Payload encoding.
    pub content_type: String,
    /// Timestamp when the job was created (Unix timestamp in seconds).
    pub created_at: i64,
    /// Earliest time the job may run (for scheduled jobs).
    pub eta: Option<i64>,
    /// Error message from the last failure.
    pub last_error: Option<String>,
}

impl Job {
    /// Create a new job for the named task.
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            args,
            retries: 0,
            status: JobStatus::Pending,
            content_type: JSON_CONTENT_TYPE.to_string(),
            created_at: current_timestamp(),
            eta: None,
            last_error: None,
        }
    }

    /// Schedule the job to run at a specific time.
    pub fn schedule_at(mut self, timestamp: i64) -> Self {
        self.eta = Some(timestamp);
        self.status = JobStatus::Scheduled;
        self
    }

    /// Schedule the job to run after a delay.
    pub fn schedule_in(self, delay: Duration) -> Self {
        let run_at = current_timestamp() + delay.as_secs() as i64;
        self.schedule_at(run_at)
    }

    /// Whether the payload uses an encoding listed in `accept`.
    ///
    /// Entries may be short names (`json`) or full MIME types.
    pub fn is_accepted(&self, accept: &[String]) -> bool {
        accept.iter().any(|a| {
            a == &self.content_type || format!("application/{}", a) == self.content_type
        })
    }

    /// Arguments normalised for deserialization: `null` becomes `{}`.
    pub fn kwargs(&self) -> Value {
        match &self.args {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        }
    }

    /// Serialize the job to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a job from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Current Unix timestamp in seconds.
pub(crate) fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_creation() {
        let job = Job::new("tasks.simple_task", json!({"message": "hello"}));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retries, 0);
        assert_eq!(job.content_type, JSON_CONTENT_TYPE);
        assert!(job.eta.is_none());
        assert!(job.last_error.is_none());
    }

    #[test]
    fn test_job_serialization() {
        let job = Job::new("tasks.simple_task", json!({"message": "test"}));
        let json = job.to_json().unwrap();
        let parsed = Job::from_json(&json).unwrap();
        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.args["message"], "test");
    }

    #[test]
    fn test_job_id_is_plain_string_on_the_wire() {
        let id = JobId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        assert_eq!(JobId::parse(&id.to_string()), Some(id));
    }

    #[test]
    fn test_job_id_parse_invalid() {
        assert!(JobId::parse("not-a-uuid").is_none());
    }

    #[test]
    fn test_job_schedule_in() {
        let before = current_timestamp();
        let job = Job::new("tasks.simple_task", Value::Null).schedule_in(Duration::from_secs(3600));
        let after = current_timestamp();

        assert_eq!(job.status, JobStatus::Scheduled);
        let eta = job.eta.unwrap();
        assert!(eta >= before + 3600);
        assert!(eta <= after + 3600);
    }

    #[test]
    fn test_job_accepts_json_by_short_name() {
        let job = Job::new("tasks.simple_task", Value::Null);
        assert!(job.is_accepted(&["json".to_string()]));
        assert!(job.is_accepted(&[JSON_CONTENT_TYPE.to_string()]));
        assert!(!job.is_accepted(&["pickle".to_string()]));
    }

    #[test]
    fn test_job_kwargs_null_becomes_object() {
        let job = Job::new("tasks.periodic_task", Value::Null);
        assert_eq!(job.kwargs(), json!({}));

        let job = Job::new("tasks.simple_task", json!({"message": "x"}));
        assert_eq!(job.kwargs(), json!({"message": "x"}));
    }

    #[test]
    fn test_job_status_serialization() {
        let json = serde_json::to_string(&JobStatus::Retry).unwrap();
        assert_eq!(json, "\"Retry\"");
    }
}
