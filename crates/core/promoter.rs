//! Promotion of delayed jobs into the ready queue.
//!
//! Jobs wait in one of two time-ordered sets: the ETA set filled by
//! [`Client::schedule_job`](crate::Client::schedule_job) and the retry set
//! filled by workers after a failed delivery. A [`Promoter`] drains one of them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::error::Result;
use crate::job::current_timestamp;

/// Which delayed set a promoter drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayedSet {
    /// Jobs sent with an ETA or countdown.
    Scheduled,
    /// Jobs waiting out a retry delay.
    Retries,
}

impl fmt::Display for DelayedSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelayedSet::Scheduled => f.write_str("scheduled"),
            DelayedSet::Retries => f.write_str("retries"),
        }
    }
}

/// Moves due jobs from a [`DelayedSet`] to the ready queue.
pub struct Promoter<B: Backend> {
    backend: B,
    namespace: String,
    set: DelayedSet,
    interval: Duration,
    batch_size: usize,
    running: Arc<AtomicBool>,
}

impl<B: Backend> Promoter<B> {
    pub fn new(
        backend: B,
        namespace: impl Into<String>,
        set: DelayedSet,
        interval: Duration,
        batch_size: usize,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            set,
            interval,
            batch_size,
            running,
        }
    }

    /// Promote due jobs every `interval` until the running flag clears.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(namespace = %self.namespace, set = %self.set, "Promoter started");

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.tick().await {
                tracing::error!(set = %self.set, error = %e, "Promotion failed");
            }
            tokio::time::sleep(self.interval).await;
        }

        tracing::info!(namespace = %self.namespace, set = %self.set, "Promoter stopped");
        Ok(())
    }

    /// Promote one batch of due jobs. Returns how many moved.
    pub async fn tick(&self) -> Result<usize> {
        let ns = self.namespace.as_str();
        let now = current_timestamp();

        let due = match self.set {
            DelayedSet::Scheduled => self.backend.get_due_scheduled(ns, now, self.batch_size).await?,
            DelayedSet::Retries => self.backend.get_due_retries(ns, now, self.batch_size).await?,
        };

        for job_json in &due {
            match self.set {
                DelayedSet::Scheduled => self.backend.move_scheduled_to_queue(ns, job_json).await?,
                DelayedSet::Retries => self.backend.move_retry_to_queue(ns, job_json).await?,
            }
        }

        if !due.is_empty() {
            tracing::debug!(count = due.len(), namespace = %ns, set = %self.set, "Promoted due jobs");
        }
        Ok(due.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn promoter(backend: &MemoryBackend, set: DelayedSet) -> Promoter<MemoryBackend> {
        Promoter::new(
            backend.clone(),
            "app",
            set,
            Duration::from_secs(1),
            100,
            Arc::new(AtomicBool::new(true)),
        )
    }

    #[tokio::test]
    async fn test_promotes_only_due_scheduled_jobs() {
        let backend = MemoryBackend::new();
        let now = current_timestamp();
        backend.schedule_job("app", "due", now - 1).await.unwrap();
        backend.schedule_job("app", "later", now + 3600).await.unwrap();

        assert_eq!(promoter(&backend, DelayedSet::Scheduled).tick().await.unwrap(), 1);
        assert_eq!(backend.queue_len("app").await.unwrap(), 1);
        assert_eq!(backend.schedule_len("app").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_promotes_only_due_retries() {
        let backend = MemoryBackend::new();
        let now = current_timestamp();
        backend.retry_job("app", "due", now - 1).await.unwrap();
        backend.retry_job("app", "later", now + 3600).await.unwrap();

        let retries = promoter(&backend, DelayedSet::Retries);
        assert_eq!(retries.tick().await.unwrap(), 1);
        assert_eq!(retries.tick().await.unwrap(), 0);
        assert_eq!(backend.queue_len("app").await.unwrap(), 1);
        assert_eq!(backend.retry_len("app").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sets_are_independent() {
        let backend = MemoryBackend::new();
        let now = current_timestamp();
        backend.retry_job("app", "retry", now - 1).await.unwrap();

        assert_eq!(promoter(&backend, DelayedSet::Scheduled).tick().await.unwrap(), 0);
        assert_eq!(backend.retry_len("app").await.unwrap(), 1);
    }
}
