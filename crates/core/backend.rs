//! Backend abstraction for broker and result storage.
//!
//! The broker side (`Backend`) holds the job queues, the delayed sets, the
//! dead-letter queues and the worker bookkeeping used for redelivery. The
//! result side (`ResultBackend`) keeps task outcomes keyed by job id. Both
//! exchange jobs as JSON strings so the storage layer never needs the
//! runtime's types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// What a pool publishes with every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolInfo {
    pub pool_id: String,
    /// Unix seconds of the latest heartbeat.
    pub heartbeat_at: i64,
    /// Unix seconds the pool came up.
    pub started_at: i64,
    /// Worker count.
    pub concurrency: usize,
    pub host: String,
    pub pid: u32,
    /// Registered task names, sorted.
    pub task_names: Vec<String>,
    /// Queue namespace the pool consumes.
    pub namespace: String,
}

/// Broker operations needed by clients, workers and the reaper.
///
/// All job operations take a `namespace` so several applications can share
/// one broker connection. Jobs travel as their JSON text; the delayed sets and
/// the in-progress set identify a job by that exact text.
#[async_trait]
pub trait Backend: Send + Sync {
    // ready queue

    /// Append to the ready queue (FIFO).
    async fn push_job(&self, ns: &str, job_json: &str) -> Result<()>;

    /// Take the oldest ready job, waiting up to `timeout` for one to arrive.
    async fn pop_job(&self, ns: &str, timeout: Duration) -> Result<Option<String>>;

    /// Take the oldest ready job if there is one. Fills the prefetch window.
    async fn pop_job_nowait(&self, ns: &str) -> Result<Option<String>>;

    async fn queue_len(&self, ns: &str) -> Result<usize>;

    // ETA set, scored by run time

    async fn schedule_job(&self, ns: &str, job_json: &str, run_at: i64) -> Result<()>;

    /// Up to `limit` ETA jobs with `run_at <= now`, earliest first.
    async fn get_due_scheduled(&self, ns: &str, now: i64, limit: usize) -> Result<Vec<String>>;

    async fn remove_scheduled(&self, ns: &str, job_json: &str) -> Result<()>;

    async fn schedule_len(&self, ns: &str) -> Result<usize>;

    /// Promote an ETA job. Backends able to do it atomically should override this.
    async fn move_scheduled_to_queue(&self, ns: &str, job_json: &str) -> Result<()> {
        self.remove_scheduled(ns, job_json).await?;
        self.push_job(ns, job_json).await
    }

    // retry set, scored by retry time

    async fn retry_job(&self, ns: &str, job_json: &str, retry_at: i64) -> Result<()>;

    /// Up to `limit` retries with `retry_at <= now`, earliest first.
    async fn get_due_retries(&self, ns: &str, now: i64, limit: usize) -> Result<Vec<String>>;

    async fn remove_retry(&self, ns: &str, job_json: &str) -> Result<()>;

    async fn retry_len(&self, ns: &str) -> Result<usize>;

    /// Promote a retry. Backends able to do it atomically should override this.
    async fn move_retry_to_queue(&self, ns: &str, job_json: &str) -> Result<()> {
        self.remove_retry(ns, job_json).await?;
        self.push_job(ns, job_json).await
    }

    // dead-letter queues

    async fn push_dead(&self, ns: &str, queue: &str, job_json: &str) -> Result<()>;

    async fn dead_len(&self, ns: &str, queue: &str) -> Result<usize>;

    /// A page of dead jobs, most recently dead-lettered first.
    async fn list_dead(
        &self,
        ns: &str,
        queue: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<String>>;

    /// Find a dead job by the `id` field of its record.
    async fn get_dead_by_id(&self, ns: &str, queue: &str, job_id: &str) -> Result<Option<String>>;

    async fn remove_dead(&self, ns: &str, queue: &str, job_json: &str) -> Result<()>;

    // pool liveness, shared by every namespace

    /// Register a pool or refresh its entry.
    async fn heartbeat(&self, info: &WorkerPoolInfo) -> Result<()>;

    /// Forget a pool that stopped cleanly. Its in-progress set is left alone.
    async fn remove_heartbeat(&self, pool_id: &str) -> Result<()>;

    async fn list_worker_pools(&self) -> Result<Vec<WorkerPoolInfo>>;

    /// Pools whose last heartbeat is older than `threshold_secs`.
    async fn get_stale_pools(&self, threshold_secs: u64) -> Result<Vec<String>>;

    // unacknowledged (late-ack) deliveries

    /// Track a reserved job until it is acknowledged.
    async fn mark_in_progress(&self, ns: &str, pool_id: &str, job_json: &str) -> Result<()>;

    /// Acknowledge a tracked job.
    async fn complete_in_progress(&self, ns: &str, pool_id: &str, job_json: &str) -> Result<()>;

    async fn get_in_progress_jobs(&self, ns: &str, pool_id: &str) -> Result<Vec<String>>;

    /// Drop a lost pool and hand back its unacknowledged jobs as
    /// `(namespace, job_json)` pairs.
    async fn cleanup_pool(&self, pool_id: &str) -> Result<Vec<(String, String)>>;
}

/// Storage for task outcomes.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Store an outcome, replacing any previous one. `ttl` of `None` keeps it forever.
    async fn store_result(
        &self,
        ns: &str,
        job_id: &str,
        outcome_json: &str,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Fetch the latest outcome for a job, if present and not expired.
    async fn get_result(&self, ns: &str, job_id: &str) -> Result<Option<String>>;
}

pub type DynBackend = Arc<dyn Backend>;

/// Cheaply cloneable handle to any [`Backend`].
#[derive(Clone)]
pub struct SharedBackend {
    inner: DynBackend,
}

impl SharedBackend {
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    /// Wrap an already shared backend.
    pub fn from_arc(inner: DynBackend) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &DynBackend {
        &self.inner
    }
}

#[async_trait]
impl Backend for SharedBackend {
    async fn push_job(&self, ns: &str, job_json: &str) -> Result<()> {
        self.inner.push_job(ns, job_json).await
    }

    async fn pop_job(&self, ns: &str, timeout: Duration) -> Result<Option<String>> {
        self.inner.pop_job(ns, timeout).await
    }

    async fn pop_job_nowait(&self, ns: &str) -> Result<Option<String>> {
        self.inner.pop_job_nowait(ns).await
    }

    async fn queue_len(&self, ns: &str) -> Result<usize> {
        self.inner.queue_len(ns).await
    }

    async fn schedule_job(&self, ns: &str, job_json: &str, run_at: i64) -> Result<()> {
        self.inner.schedule_job(ns, job_json, run_at).await
    }

    async fn get_due_scheduled(&self, ns: &str, now: i64, limit: usize) -> Result<Vec<String>> {
        self.inner.get_due_scheduled(ns, now, limit).await
    }

    async fn remove_scheduled(&self, ns: &str, job_json: &str) -> Result<()> {
        self.inner.remove_scheduled(ns, job_json).await
    }

    async fn schedule_len(&self, ns: &str) -> Result<usize> {
        self.inner.schedule_len(ns).await
    }

    async fn move_scheduled_to_queue(&self, ns: &str, job_json: &str) -> Result<()> {
        self.inner.move_scheduled_to_queue(ns, job_json).await
    }

    async fn retry_job(&self, ns: &str, job_json: &str, retry_at: i64) -> Result<()> {
        self.inner.retry_job(ns, job_json, retry_at).await
    }

    async fn get_due_retries(&self, ns: &str, now: i64, limit: usize) -> Result<Vec<String>> {
        self.inner.get_due_retries(ns, now, limit).await
    }

    async fn remove_retry(&self, ns: &str, job_json: &str) -> Result<()> {
        self.inner.remove_retry(ns, job_json).await
    }

    async fn retry_len(&self, ns: &str) -> Result<usize> {
        self.inner.retry_len(ns).await
    }

    async fn move_retry_to_queue(&self, ns: &str, job_json: &str) -> Result<()> {
        self.inner.move_retry_to_queue(ns, job_json).await
    }

    async fn push_dead(&self, ns: &str, queue: &str, job_json: &str) -> Result<()> {
        self.inner.push_dead(ns, queue, job_json).await
    }

    async fn dead_len(&self, ns: &str, queue: &str) -> Result<usize> {
        self.inner.dead_len(ns, queue).await
    }

    async fn list_dead(
        &self,
        ns: &str,
        queue: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<String>> {
        self.inner.list_dead(ns, queue, limit, offset).await
    }

    async fn get_dead_by_id(&self, ns: &str, queue: &str, job_id: &str) -> Result<Option<String>> {
        self.inner.get_dead_by_id(ns, queue, job_id).await
    }

    async fn remove_dead(&self, ns: &str, queue: &str, job_json: &str) -> Result<()> {
        self.inner.remove_dead(ns, queue, job_json).await
    }

    async fn heartbeat(&self, info: &WorkerPoolInfo) -> Result<()> {
        self.inner.heartbeat(info).await
    }

    async fn remove_heartbeat(&self, pool_id: &str) -> Result<()> {
        self.inner.remove_heartbeat(pool_id).await
    }

    async fn list_worker_pools(&self) -> Result<Vec<WorkerPoolInfo>> {
        self.inner.list_worker_pools().await
    }

    async fn get_stale_pools(&self, threshold_secs: u64) -> Result<Vec<String>> {
        self.inner.get_stale_pools(threshold_secs).await
    }

    async fn mark_in_progress(&self, ns: &str, pool_id: &str, job_json: &str) -> Result<()> {
        self.inner.mark_in_progress(ns, pool_id, job_json).await
    }

    async fn complete_in_progress(&self, ns: &str, pool_id: &str, job_json: &str) -> Result<()> {
        self.inner.complete_in_progress(ns, pool_id, job_json).await
    }

    async fn get_in_progress_jobs(&self, ns: &str, pool_id: &str) -> Result<Vec<String>> {
        self.inner.get_in_progress_jobs(ns, pool_id).await
    }

    async fn cleanup_pool(&self, pool_id: &str) -> Result<Vec<(String, String)>> {
        self.inner.cleanup_pool(pool_id).await
    }
}

/// Cheaply cloneable handle to any [`ResultBackend`].
#[derive(Clone)]
pub struct SharedResultBackend {
    inner: Arc<dyn ResultBackend>,
}

impl SharedResultBackend {
    pub fn new<R: ResultBackend + 'static>(results: R) -> Self {
        Self {
            inner: Arc::new(results),
        }
    }

    /// Wrap an already shared result backend.
    pub fn from_arc(inner: Arc<dyn ResultBackend>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ResultBackend for SharedResultBackend {
    async fn store_result(
        &self,
        ns: &str,
        job_id: &str,
        outcome_json: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.inner.store_result(ns, job_id, outcome_json, ttl).await
    }

    async fn get_result(&self, ns: &str, job_id: &str) -> Result<Option<String>> {
        self.inner.get_result(ns, job_id).await
    }
}
