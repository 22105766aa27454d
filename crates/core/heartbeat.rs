//! Pool liveness.
//!
//! Every pool refreshes a [`WorkerPoolInfo`] entry in the broker. An entry
//! that stops being refreshed marks the pool as lost, and the [`Reaper`]
//! of any surviving pool settles the jobs it never acknowledged.
//!
//! [`Reaper`]: crate::Reaper

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::backend::{Backend, WorkerPoolInfo};
use crate::error::Result;
use crate::job::current_timestamp;

/// Publishes a pool's heartbeat until the running flag clears.
pub struct Heartbeater<B: Backend> {
    backend: B,
    info: WorkerPoolInfo,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl<B: Backend> Heartbeater<B> {
    /// `info` is published as given, with `heartbeat_at` refreshed on every beat.
    pub fn new(
        backend: B,
        info: WorkerPoolInfo,
        interval: Duration,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            backend,
            info,
            interval,
            running,
        }
    }

    /// Beat once right away and then every interval until the flag clears.
    ///
    /// The entry is left in place on stop. The pool withdraws it once nothing
    /// it reserved is left unacknowledged; otherwise it goes stale and another
    /// pool's reaper settles the leftovers.
    pub async fn run(&self) -> Result<()> {
        let pool_id = self.info.pool_id.as_str();
        tracing::debug!(pool_id = %pool_id, "Heartbeater started");

        self.send_heartbeat().await?;

        let mut ticks = tokio::time::interval(self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticks.tick().await;

        loop {
            ticks.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.send_heartbeat().await {
                tracing::error!(pool_id = %pool_id, error = %e, "Heartbeat failed");
            }
        }

        tracing::debug!(pool_id = %pool_id, "Heartbeater stopped");
        Ok(())
    }

    pub async fn send_heartbeat(&self) -> Result<()> {
        let info = WorkerPoolInfo {
            heartbeat_at: current_timestamp(),
            ..self.info.clone()
        };
        self.backend.heartbeat(&info).await?;
        tracing::trace!(pool_id = %info.pool_id, at = info.heartbeat_at, "Heartbeat");
        Ok(())
    }
}

/// Describe a pool running in this process, starting now.
pub fn pool_info(
    pool_id: impl Into<String>,
    namespace: impl Into<String>,
    concurrency: usize,
    task_names: Vec<String>,
) -> WorkerPoolInfo {
    let now = current_timestamp();
    WorkerPoolInfo {
        pool_id: pool_id.into(),
        heartbeat_at: now,
        started_at: now,
        concurrency,
        host: host_name(),
        pid: std::process::id(),
        task_names,
        namespace: namespace.into(),
    }
}

fn host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// `{host}-{pid}-{unix seconds}`.
pub fn generate_pool_id() -> String {
    format!("{}-{}-{}", host_name(), std::process::id(), current_timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    #[test]
    fn test_generate_pool_id() {
        let id = generate_pool_id();
        assert!(id.contains(&format!("-{}-", std::process::id())));
    }

    #[tokio::test]
    async fn test_heartbeat_registers_pool() {
        let backend = MemoryBackend::new();
        let info = pool_info("pool-1", "app", 4, vec!["tasks.simple_task".to_string()]);
        let heartbeater = Heartbeater::new(
            backend.clone(),
            info,
            Duration::from_secs(10),
            Arc::new(AtomicBool::new(true)),
        );

        heartbeater.send_heartbeat().await.unwrap();

        let pools = backend.list_worker_pools().await.unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].pool_id, "pool-1");
        assert_eq!(pools[0].namespace, "app");
        assert_eq!(pools[0].concurrency, 4);
        assert_eq!(pools[0].pid, std::process::id());
        assert_eq!(pools[0].task_names, vec!["tasks.simple_task".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_beating_when_flag_clears() {
        let backend = MemoryBackend::new();
        let running = Arc::new(AtomicBool::new(true));
        let heartbeater = Heartbeater::new(
            backend.clone(),
            pool_info("pool-1", "app", 1, vec![]),
            Duration::from_secs(1),
            running.clone(),
        );

        let handle = tokio::spawn(async move { heartbeater.run().await });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(backend.list_worker_pools().await.unwrap().len(), 1);

        running.store(false, Ordering::SeqCst);
        handle.await.unwrap().unwrap();

        // left for the pool to withdraw
        assert_eq!(backend.list_worker_pools().await.unwrap().len(), 1);
    }
}
