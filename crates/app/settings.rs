//! Application settings read from the environment.

use courier_core::{ResultPolicy, TaskPolicy, WorkerConfig};
use std::path::PathBuf;
use std::time::Duration;

use crate::NAMESPACE;

/// Host of the broker Redis instance.
pub const BROKER_HOST_VAR: &str = "CELERY_BROKER_HOST";
/// Host of the result-store Redis instance.
pub const REDIS_HOST_VAR: &str = "CELERY_REDIS_HOST";
/// File holding the beat's per-entry state.
pub const BEAT_SCHEDULE_FILENAME_VAR: &str = "CELERY_BEAT_SCHEDULE_FILENAME";

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_BEAT_SCHEDULE_FILENAME: &str = "celerybeat-schedule";

/// Connection strings and global task policy.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Broker URI, `redis://{host}:6379/1`.
    pub broker_url: String,
    /// Result store URI, `redis://{host}:6379/0`.
    pub result_backend_url: String,
    pub beat_schedule_filename: PathBuf,
    /// Policy every task inherits unless it overrides a field.
    pub task_defaults: TaskPolicy,
    pub results: ResultPolicy,
    pub prefetch_multiplier: usize,
    pub accept_content: Vec<String>,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, falling back to local defaults.
    ///
    /// Hosts are embedded verbatim; a malformed value only surfaces when the
    /// Redis client connects.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let broker_host = lookup(BROKER_HOST_VAR).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let redis_host = lookup(REDIS_HOST_VAR).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let beat_schedule_filename = lookup(BEAT_SCHEDULE_FILENAME_VAR)
            .unwrap_or_else(|| DEFAULT_BEAT_SCHEDULE_FILENAME.to_string());

        Self {
            broker_url: format!("redis://{}:6379/1", broker_host),
            result_backend_url: format!("redis://{}:6379/0", redis_host),
            beat_schedule_filename: PathBuf::from(beat_schedule_filename),
            task_defaults: TaskPolicy {
                max_retries: 3,
                default_retry_delay: Duration::from_secs(60),
                retry_backoff: true,
                retry_backoff_max: Duration::from_secs(600),
                time_limit: Some(Duration::from_secs(300)),
                soft_time_limit: Some(Duration::from_secs(240)),
                acks_late: true,
                reject_on_worker_lost: true,
                dead_letter_queue: "dlq".to_string(),
            },
            results: ResultPolicy {
                expires: Some(Duration::from_secs(3600)),
                persistent: true,
            },
            prefetch_multiplier: 1,
            accept_content: vec!["json".to_string()],
        }
    }

    /// Worker pool configuration for `num_workers` workers.
    pub fn worker_config(&self, num_workers: usize) -> WorkerConfig {
        WorkerConfig::builder()
            .namespace(NAMESPACE)
            .num_workers(num_workers)
            .prefetch_multiplier(self.prefetch_multiplier)
            .accept_content(self.accept_content.iter().cloned())
            .results(self.results.clone())
            .build()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_point_at_localhost() {
        let settings = Settings::default();
        assert_eq!(settings.broker_url, "redis://localhost:6379/1");
        assert_eq!(settings.result_backend_url, "redis://localhost:6379/0");
        assert_eq!(
            settings.beat_schedule_filename,
            PathBuf::from("celerybeat-schedule")
        );
    }

    #[test]
    fn test_hosts_are_embedded_verbatim() {
        let settings = Settings::from_lookup(lookup_from(&[
            (BROKER_HOST_VAR, "broker"),
            (REDIS_HOST_VAR, "results.internal"),
            (BEAT_SCHEDULE_FILENAME_VAR, "/var/lib/courier/beat.db"),
        ]));
        assert_eq!(settings.broker_url, "redis://broker:6379/1");
        assert_eq!(settings.result_backend_url, "redis://results.internal:6379/0");
        assert_eq!(
            settings.beat_schedule_filename,
            PathBuf::from("/var/lib/courier/beat.db")
        );
    }

    #[test]
    fn test_global_policy() {
        let settings = Settings::default();
        let policy = &settings.task_defaults;
        assert!(policy.acks_late);
        assert!(policy.reject_on_worker_lost);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.default_retry_delay, Duration::from_secs(60));
        assert!(policy.retry_backoff);
        assert_eq!(policy.retry_backoff_max, Duration::from_secs(600));
        assert_eq!(policy.time_limit, Some(Duration::from_secs(300)));
        assert_eq!(policy.soft_time_limit, Some(Duration::from_secs(240)));
        assert_eq!(policy.dead_letter_queue, "dlq");
        assert_eq!(settings.results.expires, Some(Duration::from_secs(3600)));
        assert!(settings.results.persistent);
    }

    #[test]
    fn test_worker_config() {
        let config = Settings::default().worker_config(8);
        assert_eq!(config.namespace, NAMESPACE);
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.prefetch_multiplier, 1);
        assert_eq!(config.accept_content, vec!["json".to_string()]);
    }
}
