//! Worker pool settings.

use std::time::Duration;

use crate::policy::ResultPolicy;

/// Runtime knobs of a [`WorkerPool`](crate::WorkerPool).
///
/// Task behaviour (retries, limits, ack mode) lives in the registry's
/// [`TaskPolicy`](crate::TaskPolicy); this struct only covers the pool itself.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue namespace the pool consumes.
    pub namespace: String,
    pub num_workers: usize,
    /// Jobs a worker reserves per fetch. Never below 1.
    pub prefetch_multiplier: usize,
    /// Accepted payload encodings, short (`json`) or MIME form.
    pub accept_content: Vec<String>,
    pub results: ResultPolicy,
    /// Longest a worker blocks waiting for the ready queue.
    pub fetch_timeout: Duration,
    /// How often due ETA and retry jobs are promoted to the ready queue.
    pub promote_interval: Duration,
    /// Most jobs promoted from one delayed set per pass.
    pub promote_batch: usize,
    /// Longest shutdown waits for in-flight jobs.
    pub shutdown_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reaper_interval: Duration,
    /// Heartbeat age after which another pool's jobs are recovered.
    pub stale_threshold: Duration,
    pub enable_reaper: bool,
    /// Generated from host, pid and start time when unset.
    pub pool_id: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            namespace: "courier".to_string(),
            num_workers: 4,
            prefetch_multiplier: 1,
            accept_content: vec!["json".to_string()],
            results: ResultPolicy::default(),
            fetch_timeout: Duration::from_secs(5),
            promote_interval: Duration::from_secs(1),
            promote_batch: 100,
            shutdown_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            reaper_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            enable_reaper: true,
            pool_id: None,
        }
    }
}

impl WorkerConfig {
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::default()
    }
}

/// Fluent construction of a [`WorkerConfig`], starting from the defaults.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn num_workers(mut self, num: usize) -> Self {
        self.config.num_workers = num;
        self
    }

    /// Values below 1 are raised to 1.
    pub fn prefetch_multiplier(mut self, multiplier: usize) -> Self {
        self.config.prefetch_multiplier = multiplier.max(1);
        self
    }

    pub fn accept_content<I, S>(mut self, accept: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.accept_content = accept.into_iter().map(Into::into).collect();
        self
    }

    pub fn results(mut self, results: ResultPolicy) -> Self {
        self.config.results = results;
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    pub fn promote_interval(mut self, interval: Duration) -> Self {
        self.config.promote_interval = interval;
        self
    }

    pub fn promote_batch(mut self, batch: usize) -> Self {
        self.config.promote_batch = batch.max(1);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.config.reaper_interval = interval;
        self
    }

    pub fn stale_threshold(mut self, threshold: Duration) -> Self {
        self.config.stale_threshold = threshold;
        self
    }

    /// Turn recovery of lost pools on or off for this pool.
    pub fn enable_reaper(mut self, enabled: bool) -> Self {
        self.config.enable_reaper = enabled;
        self
    }

    pub fn pool_id(mut self, pool_id: impl Into<String>) -> Self {
        self.config.pool_id = Some(pool_id.into());
        self
    }

    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.namespace, "courier");
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.prefetch_multiplier, 1);
        assert_eq!(config.accept_content, vec!["json".to_string()]);
        assert!(config.enable_reaper);
        assert!(config.pool_id.is_none());
    }

    #[test]
    fn test_builder_overrides_defaults() {
        let config = WorkerConfig::builder()
            .namespace("app")
            .num_workers(8)
            .prefetch_multiplier(4)
            .promote_interval(Duration::from_millis(250))
            .pool_id("pool-a")
            .enable_reaper(false)
            .build();

        assert_eq!(config.namespace, "app");
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.prefetch_multiplier, 4);
        assert_eq!(config.promote_interval, Duration::from_millis(250));
        assert_eq!(config.pool_id.as_deref(), Some("pool-a"));
        assert!(!config.enable_reaper);
    }

    #[test]
    fn test_floors() {
        let config = WorkerConfig::builder()
            .prefetch_multiplier(0)
            .promote_batch(0)
            .build();
        assert_eq!(config.prefetch_multiplier, 1);
        assert_eq!(config.promote_batch, 1);
    }
}
