//! Individual worker: reserves jobs, runs their handlers and settles the outcome.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::backend::{Backend, ResultBackend, SharedBackend, SharedResultBackend};
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::job::{current_timestamp, Job, JobStatus};
use crate::registry::{JobError, JobResult, RegisteredTask, Registry, TaskContext};
use crate::result::TaskOutcome;

/// State shared by every worker of a pool.
#[derive(Clone)]
pub(crate) struct WorkerShared {
    pub pool_id: String,
    pub backend: SharedBackend,
    pub results: Option<SharedResultBackend>,
    pub registry: Arc<Registry>,
    pub config: Arc<WorkerConfig>,
}

/// A reserved job ready to execute.
struct Delivery {
    job: Job,
    /// Payload as popped from the queue; identifies the in-progress entry.
    raw: String,
    task: RegisteredTask,
    /// Whether the delivery is tracked until acknowledged (late ack).
    tracked: bool,
}

/// Individual worker that processes jobs.
pub(crate) struct Worker {
    id: usize,
    shared: WorkerShared,
    running: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    in_progress: Arc<AtomicUsize>,
    drain_notify: Arc<Notify>,
}

impl Worker {
    pub fn new(
        id: usize,
        shared: WorkerShared,
        running: Arc<AtomicBool>,
        draining: Arc<AtomicBool>,
        in_progress: Arc<AtomicUsize>,
        drain_notify: Arc<Notify>,
    ) -> Self {
        Self {
            id,
            shared,
            running,
            draining,
            in_progress,
            drain_notify,
        }
    }

    fn namespace(&self) -> &str {
        &self.shared.config.namespace
    }

    pub async fn run(&self) -> Result<()> {
        tracing::debug!(worker_id = self.id, "Worker started");

        while self.running.load(Ordering::SeqCst) {
            if self.draining.load(Ordering::SeqCst) {
                tracing::debug!(worker_id = self.id, "Worker draining, stopping fetch");
                break;
            }

            if let Err(e) = self.fetch_and_process().await {
                tracing::error!(worker_id = self.id, error = %e, "Worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        tracing::debug!(worker_id = self.id, "Worker stopped");
        Ok(())
    }

    /// Reserve up to `prefetch_multiplier` jobs and run them in order.
    ///
    /// Returns `false` when the queue stayed empty for the fetch timeout.
    async fn fetch_and_process(&self) -> Result<bool> {
        let Some(first) = self
            .shared
            .backend
            .pop_job(self.namespace(), self.shared.config.fetch_timeout)
            .await?
        else {
            return Ok(false);
        };

        let mut reserved = vec![first];
        while reserved.len() < self.shared.config.prefetch_multiplier {
            match self.shared.backend.pop_job_nowait(self.namespace()).await? {
                Some(json) => reserved.push(json),
                None => break,
            }
        }

        // one bad delivery must not strand the rest of the batch
        let mut deliveries = Vec::with_capacity(reserved.len());
        for raw in reserved {
            match self.receive(raw.clone()).await {
                Ok(Some(delivery)) => deliveries.push(delivery),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(worker_id = self.id, error = %e, "Failed to receive job");
                    self.release(&raw).await;
                }
            }
        }

        for delivery in deliveries {
            if let Err(e) = self.execute(delivery).await {
                tracing::error!(worker_id = self.id, error = %e, "Failed to settle job");
            }
        }

        Ok(true)
    }

    /// Put a payload that could not be received back on the ready queue.
    async fn release(&self, raw: &str) {
        if let Err(e) = self.shared.backend.push_job(self.namespace(), raw).await {
            tracing::error!(worker_id = self.id, error = %e, "Failed to return job to queue");
        }
    }

    /// Validate a popped payload and reserve it.
    ///
    /// Payloads that can never run (unparseable, refused content type,
    /// unregistered task) are dead-lettered here and yield `None`.
    async fn receive(&self, raw: String) -> Result<Option<Delivery>> {
        let defaults = self.shared.registry.defaults();

        let mut job = match Job::from_json(&raw) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(error = %e, "Failed to parse job, moving to dead queue");
                self.shared
                    .backend
                    .push_dead(self.namespace(), &defaults.dead_letter_queue, &raw)
                    .await?;
                return Ok(None);
            }
        };

        let refusal = if !job.is_accepted(&self.shared.config.accept_content) {
            Some(format!("Refused content type: {}", job.content_type))
        } else if self.shared.registry.get(&job.name).is_none() {
            Some(format!("Unknown task: {}", job.name))
        } else {
            None
        };

        if let Some(reason) = refusal {
            tracing::warn!(
                worker_id = self.id,
                job_id = %job.id,
                task = %job.name,
                reason = %reason,
                "Job rejected, moving to dead queue"
            );
            job.status = JobStatus::Dead;
            job.last_error = Some(reason);
            self.shared
                .backend
                .push_dead(self.namespace(), &defaults.dead_letter_queue, &job.to_json()?)
                .await?;
            return Ok(None);
        }

        let Some(task) = self.shared.registry.get(&job.name).cloned() else {
            return Ok(None);
        };

        let tracked = task.policy().acks_late;
        if tracked {
            self.shared
                .backend
                .mark_in_progress(self.namespace(), &self.shared.pool_id, &raw)
                .await?;
        }

        self.in_progress.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Delivery {
            job,
            raw,
            task,
            tracked,
        }))
    }

    async fn execute(&self, delivery: Delivery) -> Result<()> {
        let Delivery {
            mut job,
            raw,
            task,
            tracked,
        } = delivery;
        let policy = task.policy();

        tracing::debug!(
            worker_id = self.id,
            job_id = %job.id,
            task = %job.name,
            attempt = job.retries + 1,
            "Processing job"
        );

        let ctx = TaskContext::new(&job, policy);
        let handler = task.call(ctx, job.kwargs());
        let result: JobResult = match policy.time_limit {
            Some(limit) => match tokio::time::timeout(limit, handler).await {
                Ok(result) => result,
                Err(_) => Err(JobError::retryable(format!(
                    "Hard time limit ({}s) exceeded",
                    limit.as_secs()
                ))),
            },
            None => handler.await,
        };

        let settled = self.settle(&mut job, &task, result).await;

        // an unsettled job stays tracked so it is recovered like a lost one
        if tracked && settled.is_ok() {
            if let Err(e) = self
                .shared
                .backend
                .complete_in_progress(self.namespace(), &self.shared.pool_id, &raw)
                .await
            {
                tracing::warn!(error = %e, "Failed to acknowledge job in backend");
            }
        }
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
        self.drain_notify.notify_one();

        settled
    }

    /// Record the handler's result: store the outcome, then retry or dead-letter failures.
    async fn settle(&self, job: &mut Job, task: &RegisteredTask, result: JobResult) -> Result<()> {
        let policy = task.policy();

        let err = match result {
            Ok(value) => {
                tracing::debug!(
                    worker_id = self.id,
                    job_id = %job.id,
                    "Job completed successfully"
                );
                self.store_outcome(TaskOutcome::success(job, value)).await;
                return Ok(());
            }
            Err(err) => err,
        };

        job.last_error = Some(err.message.clone());

        if err.retryable && policy.can_retry(job.retries) {
            let delay = err
                .countdown
                .unwrap_or_else(|| policy.retry_delay(job.retries));
            if let Some(args) = err.args {
                job.args = args;
            }
            job.retries += 1;
            job.status = JobStatus::Retry;

            let retry_at = current_timestamp() + delay.as_secs() as i64;
            self.shared
                .backend
                .retry_job(self.namespace(), &job.to_json()?, retry_at)
                .await?;

            tracing::debug!(
                worker_id = self.id,
                job_id = %job.id,
                retries = job.retries,
                retry_at = retry_at,
                error = %err.message,
                "Job scheduled for retry"
            );
            self.store_outcome(TaskOutcome::retry(job, err.message)).await;
        } else {
            job.status = JobStatus::Dead;
            self.shared
                .backend
                .push_dead(self.namespace(), &policy.dead_letter_queue, &job.to_json()?)
                .await?;

            tracing::warn!(
                worker_id = self.id,
                job_id = %job.id,
                task = %job.name,
                retries = job.retries,
                queue = %policy.dead_letter_queue,
                error = %err.message,
                "Job moved to dead queue"
            );
            self.store_outcome(TaskOutcome::failure(job, err.message)).await;
        }

        Ok(())
    }

    async fn store_outcome(&self, outcome: TaskOutcome) {
        let policy = &self.shared.config.results;
        let Some(results) = self.shared.results.as_ref().filter(|_| policy.persistent) else {
            return;
        };

        let stored = match serde_json::to_string(&outcome) {
            Ok(json) => {
                results
                    .store_result(
                        self.namespace(),
                        &outcome.job_id.to_string(),
                        &json,
                        policy.expires,
                    )
                    .await
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = stored {
            tracing::warn!(job_id = %outcome.job_id, error = %e, "Failed to store result");
        }
    }
}
