//! Worker pool: workers plus the promoter, heartbeater and reaper loops.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use crate::backend::{Backend, ResultBackend, SharedBackend, SharedResultBackend};
use crate::config::WorkerConfig;
use crate::error::{CourierError, Result};
use crate::heartbeat::{generate_pool_id, pool_info, Heartbeater};
use crate::promoter::{DelayedSet, Promoter};
use crate::reaper::Reaper;
use crate::registry::Registry;
use crate::worker::{Worker, WorkerShared};

/// Builder for WorkerPool.
#[derive(Default)]
pub struct WorkerPoolBuilder {
    config: WorkerConfig,
    registry: Option<Registry>,
    backend: Option<SharedBackend>,
    results: Option<SharedResultBackend>,
}

impl WorkerPoolBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the broker backend.
    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(SharedBackend::new(backend));
        self
    }

    /// Set the result backend. Without one, outcomes are not stored.
    pub fn results(mut self, results: impl ResultBackend + 'static) -> Self {
        self.results = Some(SharedResultBackend::new(results));
        self
    }

    /// Set the task registry.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Set the number of workers.
    pub fn workers(mut self, num: usize) -> Self {
        self.config.num_workers = num;
        self
    }

    /// Set how many jobs each worker reserves per fetch.
    pub fn prefetch_multiplier(mut self, multiplier: usize) -> Self {
        self.config.prefetch_multiplier = multiplier.max(1);
        self
    }

    /// Use a fixed pool ID.
    pub fn pool_id(mut self, pool_id: impl Into<String>) -> Self {
        self.config.pool_id = Some(pool_id.into());
        self
    }

    /// Set the fetch timeout.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    /// Set the shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Build the WorkerPool.
    pub fn build(self) -> Result<WorkerPool> {
        let registry = self
            .registry
            .ok_or_else(|| CourierError::Config("Registry is required".to_string()))?;

        if registry.is_empty() {
            return Err(CourierError::Config(
                "Registry has no tasks registered".to_string(),
            ));
        }

        let backend = self
            .backend
            .ok_or_else(|| CourierError::Config("Backend is required".to_string()))?;

        if self.config.num_workers == 0 {
            return Err(CourierError::Config(
                "Worker pool needs at least one worker".to_string(),
            ));
        }

        Ok(WorkerPool::new(self.config, registry, backend, self.results))
    }
}

/// Worker pool for processing jobs.
pub struct WorkerPool {
    config: Arc<WorkerConfig>,
    registry: Arc<Registry>,
    backend: SharedBackend,
    results: Option<SharedResultBackend>,
    pool_id: String,
    running: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    in_progress: Arc<AtomicUsize>,
    drain_notify: Arc<Notify>,
}

impl WorkerPool {
    /// Create a new builder for WorkerPool.
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::new()
    }

    /// Create a worker pool from its parts.
    pub fn new(
        config: WorkerConfig,
        registry: Registry,
        backend: SharedBackend,
        results: Option<SharedResultBackend>,
    ) -> Self {
        let pool_id = config.pool_id.clone().unwrap_or_else(generate_pool_id);

        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            backend,
            results,
            pool_id,
            running: Arc::new(AtomicBool::new(false)),
            draining: Arc::new(AtomicBool::new(false)),
            in_progress: Arc::new(AtomicUsize::new(0)),
            drain_notify: Arc::new(Notify::new()),
        }
    }

    /// Get the pool ID.
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run the worker pool until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run the worker pool until `shutdown` completes, then drain.
    ///
    /// Spawns the workers, both promoters, the heartbeater and (when enabled)
    /// the reaper, and returns once every one of them has stopped. Jobs this
    /// pool id left unacknowledged, by an earlier run or by workers aborted at
    /// the shutdown timeout, are settled like those of a lost pool.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CourierError::WorkerPool(
                "Worker pool is already running".to_string(),
            ));
        }
        self.draining.store(false, Ordering::SeqCst);

        let namespace = self.config.namespace.clone();

        if let Err(e) = self
            .reaper()
            .recover_in_progress(&namespace, &self.pool_id)
            .await
        {
            tracing::error!(
                pool_id = %self.pool_id,
                error = %e,
                "Failed to settle jobs left by a previous run"
            );
        }

        let task_names = self
            .registry
            .names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let beating = Arc::new(AtomicBool::new(true));
        let heartbeater = Heartbeater::new(
            self.backend.clone(),
            pool_info(
                self.pool_id.clone(),
                namespace.clone(),
                self.config.num_workers,
                task_names,
            ),
            self.config.heartbeat_interval,
            beating.clone(),
        );
        // a separate set so it outlives the workers, and dies with this future
        let mut heartbeat = JoinSet::new();
        heartbeat.spawn(async move { heartbeater.run().await });

        let mut tasks = JoinSet::new();

        if self.config.enable_reaper {
            let reaper = self.reaper();
            tasks.spawn(async move { reaper.run().await });
        }

        for set in [DelayedSet::Scheduled, DelayedSet::Retries] {
            let promoter = Promoter::new(
                self.backend.clone(),
                namespace.clone(),
                set,
                self.config.promote_interval,
                self.config.promote_batch,
                self.running.clone(),
            );
            tasks.spawn(async move { promoter.run().await });
        }

        let shared = WorkerShared {
            pool_id: self.pool_id.clone(),
            backend: self.backend.clone(),
            results: self.results.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
        };
        for worker_id in 0..self.config.num_workers {
            let worker = Worker::new(
                worker_id,
                shared.clone(),
                self.running.clone(),
                self.draining.clone(),
                self.in_progress.clone(),
                self.drain_notify.clone(),
            );
            tasks.spawn(async move { worker.run().await });
        }

        tracing::info!(
            workers = self.config.num_workers,
            prefetch = self.config.prefetch_multiplier,
            tasks = self.registry.len(),
            namespace = %namespace,
            pool_id = %self.pool_id,
            "Worker pool started"
        );

        shutdown.await;
        tracing::info!("Shutdown requested, draining...");

        if !self.shutdown().await {
            tasks.abort_all();
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Err(e)) => tracing::error!(error = %e, "Pool task failed"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::error!(error = %e, "Task panicked"),
                Ok(Ok(())) => {}
            }
        }
        self.in_progress.store(0, Ordering::SeqCst);

        // keep beating until every worker is gone
        beating.store(false, Ordering::SeqCst);
        heartbeat.shutdown().await;

        self.release(&namespace).await;

        tracing::info!(pool_id = %self.pool_id, "Worker pool stopped");
        Ok(())
    }

    fn reaper(&self) -> Reaper<SharedBackend> {
        Reaper::new(
            self.backend.clone(),
            self.registry.clone(),
            self.config.reaper_interval,
            self.config.stale_threshold,
            self.running.clone(),
        )
    }

    /// Settle what the stopped workers left tracked, then withdraw the heartbeat.
    ///
    /// If settling fails the heartbeat stays and goes stale, so a surviving
    /// pool's reaper recovers the jobs instead.
    async fn release(&self, namespace: &str) {
        if let Err(e) = self
            .reaper()
            .recover_in_progress(namespace, &self.pool_id)
            .await
        {
            tracing::error!(
                pool_id = %self.pool_id,
                error = %e,
                "Failed to settle unacknowledged jobs, leaving heartbeat to expire"
            );
            return;
        }

        if let Err(e) = self.backend.remove_heartbeat(&self.pool_id).await {
            tracing::error!(pool_id = %self.pool_id, error = %e, "Failed to withdraw heartbeat");
        }
    }

    /// Stop fetching and wait for in-progress jobs, up to the shutdown timeout.
    ///
    /// Returns `false` when jobs were still running at the deadline.
    pub async fn shutdown(&self) -> bool {
        self.draining.store(true, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        let mut drained = true;

        while self.in_progress.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    in_progress = self.in_progress.load(Ordering::SeqCst),
                    "Shutdown timeout reached, aborting workers"
                );
                drained = false;
                break;
            }

            tokio::select! {
                _ = self.drain_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        drained
    }

    /// Get the number of in-progress jobs.
    pub fn in_progress_count(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Check if the pool is draining.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}
