//! Client for sending tasks and inspecting queues.

use serde_json::Value;
use std::time::Duration;

use crate::backend::{Backend, ResultBackend, SharedBackend, SharedResultBackend};
use crate::error::{CourierError, Result};
use crate::job::{Job, JobId};
use crate::result::TaskOutcome;

/// Client for sending tasks to a namespace.
#[derive(Clone)]
pub struct Client {
    backend: SharedBackend,
    results: Option<SharedResultBackend>,
    namespace: String,
}

impl Client {
    /// Create a new client for `namespace`.
    pub fn new(backend: impl Backend + 'static, namespace: impl Into<String>) -> Self {
        Self {
            backend: SharedBackend::new(backend),
            results: None,
            namespace: namespace.into(),
        }
    }

    /// Attach a result backend so outcomes can be looked up.
    pub fn with_results(mut self, results: impl ResultBackend + 'static) -> Self {
        self.results = Some(SharedResultBackend::new(results));
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Send a task for immediate processing.
    pub async fn send_task(&self, name: &str, args: Value) -> Result<JobId> {
        self.enqueue_job(Job::new(name, args)).await
    }

    /// Send a task that becomes runnable after `delay`.
    pub async fn send_task_in(&self, name: &str, args: Value, delay: Duration) -> Result<JobId> {
        self.schedule_job(Job::new(name, args).schedule_in(delay))
            .await
    }

    /// Send a task that becomes runnable at a Unix timestamp.
    pub async fn schedule_at(&self, name: &str, args: Value, run_at: i64) -> Result<JobId> {
        self.schedule_job(Job::new(name, args).schedule_at(run_at))
            .await
    }

    /// Enqueue a pre-built job.
    pub async fn enqueue_job(&self, job: Job) -> Result<JobId> {
        let json = job.to_json()?;

        self.backend.push_job(&self.namespace, &json).await?;

        tracing::debug!(job_id = %job.id, task = %job.name, "Job enqueued");
        Ok(job.id)
    }

    /// Schedule a pre-built job.
    pub async fn schedule_job(&self, job: Job) -> Result<JobId> {
        let run_at = job.eta.ok_or_else(|| {
            CourierError::Config("Job must have an eta set for scheduling".to_string())
        })?;
        let json = job.to_json()?;

        self.backend
            .schedule_job(&self.namespace, &json, run_at)
            .await?;

        tracing::debug!(job_id = %job.id, task = %job.name, run_at = run_at, "Job scheduled");
        Ok(job.id)
    }

    /// Get the number of jobs in the immediate queue.
    pub async fn queue_len(&self) -> Result<usize> {
        self.backend.queue_len(&self.namespace).await
    }

    /// Get the number of jobs in the schedule queue.
    pub async fn schedule_len(&self) -> Result<usize> {
        self.backend.schedule_len(&self.namespace).await
    }

    /// Get the number of jobs in the retry queue.
    pub async fn retry_len(&self) -> Result<usize> {
        self.backend.retry_len(&self.namespace).await
    }

    /// Get the number of jobs in a dead-letter queue.
    pub async fn dead_len(&self, queue: &str) -> Result<usize> {
        self.backend.dead_len(&self.namespace, queue).await
    }

    /// List dead-lettered jobs, newest first.
    ///
    /// Entries that are not job records (payloads dead-lettered because they
    /// never parsed) are skipped.
    pub async fn list_dead(&self, queue: &str, limit: usize, offset: usize) -> Result<Vec<Job>> {
        let entries = self
            .backend
            .list_dead(&self.namespace, queue, limit, offset)
            .await?;

        Ok(entries
            .iter()
            .filter_map(|json| match Job::from_json(json) {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::warn!(queue = %queue, error = %e, "Skipping unparseable dead entry");
                    None
                }
            })
            .collect())
    }

    /// Look up a dead-lettered job by id.
    pub async fn dead_job(&self, queue: &str, job_id: &JobId) -> Result<Option<Job>> {
        let json = self
            .backend
            .get_dead_by_id(&self.namespace, queue, &job_id.to_string())
            .await?;
        Ok(json.as_deref().map(Job::from_json).transpose()?)
    }

    /// Push a dead-lettered job back onto the queue with a fresh retry budget.
    pub async fn requeue_dead(&self, queue: &str, job_id: &JobId) -> Result<bool> {
        let Some(json) = self
            .backend
            .get_dead_by_id(&self.namespace, queue, &job_id.to_string())
            .await?
        else {
            return Ok(false);
        };

        let mut job = Job::from_json(&json)?;
        job.retries = 0;
        job.last_error = None;
        job.status = crate::job::JobStatus::Pending;

        self.backend
            .remove_dead(&self.namespace, queue, &json)
            .await?;
        self.enqueue_job(job).await?;
        Ok(true)
    }

    /// Latest stored outcome for a job.
    pub async fn result(&self, job_id: &JobId) -> Result<Option<TaskOutcome>> {
        let results = self.results.as_ref().ok_or_else(|| {
            CourierError::Config("Client has no result backend configured".to_string())
        })?;

        let json = results
            .get_result(&self.namespace, &job_id.to_string())
            .await?;
        Ok(json
            .as_deref()
            .map(serde_json::from_str::<TaskOutcome>)
            .transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::job::JobStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_task_enqueues() {
        let backend = MemoryBackend::new();
        let client = Client::new(backend.clone(), "test");

        let id = client
            .send_task("tasks.simple_task", json!({"message": "hi"}))
            .await
            .unwrap();
        assert_eq!(client.queue_len().await.unwrap(), 1);

        let json = backend.pop_job_nowait("test").await.unwrap().unwrap();
        let job = Job::from_json(&json).unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.name, "tasks.simple_task");
    }

    #[tokio::test]
    async fn test_send_task_in_schedules() {
        let client = Client::new(MemoryBackend::new(), "test");
        client
            .send_task_in("tasks.simple_task", Value::Null, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(client.queue_len().await.unwrap(), 0);
        assert_eq!(client.schedule_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_schedule_job_requires_eta() {
        let client = Client::new(MemoryBackend::new(), "test");
        let err = client
            .schedule_job(Job::new("tasks.simple_task", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Config(_)));
    }

    #[tokio::test]
    async fn test_requeue_dead_resets_retries() {
        let backend = MemoryBackend::new();
        let client = Client::new(backend.clone(), "test");

        let mut job = Job::new("tasks.task_that_fails_to_dlq", json!({"should_fail": true}));
        job.retries = 2;
        job.status = JobStatus::Dead;
        job.last_error = Some("Task failed intentionally".to_string());
        backend
            .push_dead("test", "dlq", &job.to_json().unwrap())
            .await
            .unwrap();

        let listed = client.list_dead("dlq", 10, 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, job.id);

        assert!(client.requeue_dead("dlq", &job.id).await.unwrap());
        assert_eq!(client.dead_len("dlq").await.unwrap(), 0);

        let json = backend.pop_job_nowait("test").await.unwrap().unwrap();
        let requeued = Job::from_json(&json).unwrap();
        assert_eq!(requeued.retries, 0);
        assert_eq!(requeued.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_list_dead_skips_unparseable_entries() {
        let backend = MemoryBackend::new();
        let client = Client::new(backend.clone(), "test");

        let job = Job::new("tasks.simple_task", json!({"message": "hi"}));
        backend
            .push_dead("test", "dlq", &job.to_json().unwrap())
            .await
            .unwrap();
        backend.push_dead("test", "dlq", "not json").await.unwrap();

        let listed = client.list_dead("dlq", 10, 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, job.id);
        assert_eq!(client.dead_len("dlq").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_result_without_backend_is_config_error() {
        let client = Client::new(MemoryBackend::new(), "test");
        let err = client.result(&JobId::new()).await.unwrap_err();
        assert!(matches!(err, CourierError::Config(_)));
    }

    #[tokio::test]
    async fn test_result_roundtrip() {
        let backend = MemoryBackend::new();
        let client = Client::new(backend.clone(), "test").with_results(backend.clone());

        let job = Job::new("tasks.simple_task", json!({"message": "hi"}));
        let outcome = TaskOutcome::success(&job, json!("Processed: hi"));
        backend
            .store_result(
                "test",
                &job.id.to_string(),
                &serde_json::to_string(&outcome).unwrap(),
                None,
            )
            .await
            .unwrap();

        let fetched = client.result(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.result, Some(json!("Processed: hi")));
        assert!(client.result(&JobId::new()).await.unwrap().is_none());
    }
}
