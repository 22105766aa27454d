//! Reaper component for stale job recovery.
//!
//! The reaper periodically looks for worker pools that stopped sending
//! heartbeats and settles the jobs they had reserved but never acknowledged.
//! Depending on the task's `reject_on_worker_lost`, such a job is either
//! redelivered or dead-lettered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::error::Result;
use crate::job::{Job, JobStatus};
use crate::registry::Registry;

/// Reaper that recovers jobs from dead worker pools.
pub struct Reaper<B: Backend> {
    backend: B,
    registry: Arc<Registry>,
    interval: Duration,
    stale_threshold: Duration,
    running: Arc<AtomicBool>,
}

impl<B: Backend + Clone + 'static> Reaper<B> {
    /// Create a new reaper.
    pub fn new(
        backend: B,
        registry: Arc<Registry>,
        interval: Duration,
        stale_threshold: Duration,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            backend,
            registry,
            interval,
            stale_threshold,
            running,
        }
    }

    /// Run the reaper loop.
    pub async fn run(&self) -> Result<()> {
        tracing::debug!("Reaper started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            if let Err(e) = self.reap_dead_pools().await {
                tracing::error!(error = %e, "Failed to reap dead pools");
            }
        }

        tracing::debug!("Reaper stopped");
        Ok(())
    }

    /// Find and recover jobs from dead worker pools.
    async fn reap_dead_pools(&self) -> Result<()> {
        let stale_pools = self
            .backend
            .get_stale_pools(self.stale_threshold.as_secs())
            .await?;

        if stale_pools.is_empty() {
            return Ok(());
        }

        tracing::info!(count = stale_pools.len(), "Found stale worker pools to reap");

        for pool_id in stale_pools {
            if let Err(e) = self.recover_pool(&pool_id).await {
                tracing::error!(pool_id = %pool_id, error = %e, "Failed to recover pool");
            }
        }

        Ok(())
    }

    /// Settle every unacknowledged job of a lost pool.
    ///
    /// Returns the number of jobs handed back to their queue.
    pub async fn recover_pool(&self, pool_id: &str) -> Result<usize> {
        tracing::info!(pool_id = %pool_id, "Recovering dead worker pool");

        let jobs = self.backend.cleanup_pool(pool_id).await?;

        if jobs.is_empty() {
            tracing::debug!(pool_id = %pool_id, "No in-progress jobs to recover");
            return Ok(0);
        }

        let mut requeued = 0;
        for (ns, job_json) in jobs {
            match self.settle_lost(&ns, &job_json).await {
                Ok(true) => requeued += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        pool_id = %pool_id,
                        namespace = %ns,
                        error = %e,
                        "Failed to settle job of lost worker"
                    );
                }
            }
        }

        tracing::info!(pool_id = %pool_id, requeued = requeued, "Pool recovery complete");
        Ok(requeued)
    }

    /// Settle the jobs a pool left unacknowledged in `ns`, leaving its heartbeat alone.
    ///
    /// A pool runs this on its own id before its workers start and after they
    /// have all stopped, when nothing it tracks can still be executing.
    pub async fn recover_in_progress(&self, ns: &str, pool_id: &str) -> Result<usize> {
        let jobs = self.backend.get_in_progress_jobs(ns, pool_id).await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        let mut requeued = 0;
        for job_json in &jobs {
            if self.settle_lost(ns, job_json).await? {
                requeued += 1;
            }
            self.backend.complete_in_progress(ns, pool_id, job_json).await?;
        }

        tracing::info!(
            pool_id = %pool_id,
            namespace = %ns,
            settled = jobs.len(),
            requeued = requeued,
            "Settled unacknowledged jobs"
        );
        Ok(requeued)
    }

    /// Redeliver or dead-letter one job. Returns `true` when redelivered.
    async fn settle_lost(&self, ns: &str, job_json: &str) -> Result<bool> {
        let mut job = match Job::from_json(job_json) {
            Ok(job) => job,
            Err(_) => {
                // let a worker dead-letter it on receipt
                self.backend.push_job(ns, job_json).await?;
                return Ok(true);
            }
        };

        let policy = self.registry.policy_for(&job.name);
        if policy.reject_on_worker_lost {
            self.backend.push_job(ns, job_json).await?;
            tracing::debug!(job_id = %job.id, task = %job.name, "Re-enqueued job of lost worker");
            return Ok(true);
        }

        job.status = JobStatus::Dead;
        job.last_error = Some("Worker lost while executing task".to_string());
        self.backend
            .push_dead(ns, &policy.dead_letter_queue, &job.to_json()?)
            .await?;
        tracing::warn!(
            job_id = %job.id,
            task = %job.name,
            queue = %policy.dead_letter_queue,
            "Job of lost worker moved to dead queue"
        );
        Ok(false)
    }
}
