//! Execution policies: global defaults and per-task overrides.

use std::time::Duration;

/// Fully resolved execution policy for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay before a retry.
    pub default_retry_delay: Duration,
    /// Whether the retry delay doubles with every retry.
    pub retry_backoff: bool,
    /// Ceiling for the exponential retry delay.
    pub retry_backoff_max: Duration,
    /// Hard limit: the handler is dropped once exceeded.
    pub time_limit: Option<Duration>,
    /// Soft limit: the handler is signalled once exceeded.
    pub soft_time_limit: Option<Duration>,
    /// Acknowledge after execution instead of on receipt.
    pub acks_late: bool,
    /// Requeue unacknowledged jobs whose worker pool disappears.
    pub reject_on_worker_lost: bool,
    /// Dead-letter queue for jobs that exhausted their retries.
    pub dead_letter_queue: String,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_retry_delay: Duration::from_secs(180),
            retry_backoff: false,
            retry_backoff_max: Duration::from_secs(600),
            time_limit: None,
            soft_time_limit: None,
            acks_late: false,
            reject_on_worker_lost: false,
            dead_letter_queue: "dead".to_string(),
        }
    }
}

impl TaskPolicy {
    /// Delay before the next retry, given the retries already performed.
    ///
    /// With backoff: `min(default_retry_delay * 2^retries, retry_backoff_max)`.
    pub fn retry_delay(&self, retries: u32) -> Duration {
        if !self.retry_backoff {
            return self.default_retry_delay;
        }
        let factor = 2u32.checked_pow(retries).unwrap_or(u32::MAX);
        self.default_retry_delay
            .checked_mul(factor)
            .map_or(self.retry_backoff_max, |d| d.min(self.retry_backoff_max))
    }

    /// Check if a job with `retries` performed may be retried again.
    pub fn can_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }
}

/// Per-task overrides of the registry's default policy.
///
/// Every field left as `None` inherits the default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOptions {
    pub max_retries: Option<u32>,
    pub default_retry_delay: Option<Duration>,
    pub retry_backoff: Option<bool>,
    pub retry_backoff_max: Option<Duration>,
    pub time_limit: Option<Duration>,
    pub soft_time_limit: Option<Duration>,
    pub acks_late: Option<bool>,
    pub reject_on_worker_lost: Option<bool>,
    pub dead_letter_queue: Option<String>,
}

impl TaskOptions {
    /// Create empty overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of retries.
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    /// Set the base retry delay.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.default_retry_delay = Some(delay);
        self
    }

    /// Enable or disable exponential backoff.
    pub fn retry_backoff(mut self, enabled: bool) -> Self {
        self.retry_backoff = Some(enabled);
        self
    }

    /// Set the backoff ceiling.
    pub fn retry_backoff_max(mut self, max: Duration) -> Self {
        self.retry_backoff_max = Some(max);
        self
    }

    /// Set the hard time limit.
    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Set the soft time limit.
    pub fn soft_time_limit(mut self, limit: Duration) -> Self {
        self.soft_time_limit = Some(limit);
        self
    }

    /// Choose late (after execution) or early (on receipt) acknowledgment.
    pub fn acks_late(mut self, late: bool) -> Self {
        self.acks_late = Some(late);
        self
    }

    /// Choose whether jobs of a lost worker are requeued.
    pub fn reject_on_worker_lost(mut self, reject: bool) -> Self {
        self.reject_on_worker_lost = Some(reject);
        self
    }

    /// Set the dead-letter queue.
    pub fn dead_letter_queue(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(queue.into());
        self
    }

    /// Apply the overrides on top of `defaults`.
    pub fn resolve(&self, defaults: &TaskPolicy) -> TaskPolicy {
        TaskPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            default_retry_delay: self
                .default_retry_delay
                .unwrap_or(defaults.default_retry_delay),
            retry_backoff: self.retry_backoff.unwrap_or(defaults.retry_backoff),
            retry_backoff_max: self.retry_backoff_max.unwrap_or(defaults.retry_backoff_max),
            time_limit: self.time_limit.or(defaults.time_limit),
            soft_time_limit: self.soft_time_limit.or(defaults.soft_time_limit),
            acks_late: self.acks_late.unwrap_or(defaults.acks_late),
            reject_on_worker_lost: self
                .reject_on_worker_lost
                .unwrap_or(defaults.reject_on_worker_lost),
            dead_letter_queue: self
                .dead_letter_queue
                .clone()
                .unwrap_or_else(|| defaults.dead_letter_queue.clone()),
        }
    }
}

/// How task results are kept in the result store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPolicy {
    /// Results are discarded after this long. `None` keeps them forever.
    pub expires: Option<Duration>,
    /// Write results to the result store at all.
    pub persistent: bool,
}

impl Default for ResultPolicy {
    fn default() -> Self {
        Self {
            expires: Some(Duration::from_secs(86_400)),
            persistent: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff_policy() -> TaskPolicy {
        TaskPolicy {
            default_retry_delay: Duration::from_secs(60),
            retry_backoff: true,
            retry_backoff_max: Duration::from_secs(600),
            ..TaskPolicy::default()
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = backoff_policy();
        assert_eq!(policy.retry_delay(0), Duration::from_secs(60));
        assert_eq!(policy.retry_delay(1), Duration::from_secs(120));
        assert_eq!(policy.retry_delay(2), Duration::from_secs(240));
        assert_eq!(policy.retry_delay(3), Duration::from_secs(480));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = backoff_policy();
        assert_eq!(policy.retry_delay(4), Duration::from_secs(600));
        assert_eq!(policy.retry_delay(40), Duration::from_secs(600));
    }

    #[test]
    fn test_fixed_delay_without_backoff() {
        let policy = TaskPolicy {
            default_retry_delay: Duration::from_secs(30),
            retry_backoff: false,
            ..TaskPolicy::default()
        };
        assert_eq!(policy.retry_delay(0), Duration::from_secs(30));
        assert_eq!(policy.retry_delay(5), Duration::from_secs(30));
    }

    #[test]
    fn test_can_retry() {
        let policy = TaskPolicy {
            max_retries: 2,
            ..TaskPolicy::default()
        };
        assert!(policy.can_retry(0));
        assert!(policy.can_retry(1));
        assert!(!policy.can_retry(2));
    }

    #[test]
    fn test_can_retry_zero_max() {
        let policy = TaskPolicy {
            max_retries: 0,
            ..TaskPolicy::default()
        };
        assert!(!policy.can_retry(0));
    }

    #[test]
    fn test_empty_options_resolve_to_defaults() {
        let defaults = backoff_policy();
        assert_eq!(TaskOptions::new().resolve(&defaults), defaults);
    }

    #[test]
    fn test_overrides_win() {
        let defaults = TaskPolicy {
            acks_late: true,
            time_limit: Some(Duration::from_secs(300)),
            soft_time_limit: Some(Duration::from_secs(240)),
            ..backoff_policy()
        };
        let resolved = TaskOptions::new()
            .max_retries(2)
            .retry_delay(Duration::from_secs(30))
            .time_limit(Duration::from_secs(30))
            .soft_time_limit(Duration::from_secs(20))
            .acks_late(false)
            .dead_letter_queue("failed")
            .resolve(&defaults);

        assert_eq!(resolved.max_retries, 2);
        assert_eq!(resolved.default_retry_delay, Duration::from_secs(30));
        assert!(resolved.retry_backoff);
        assert_eq!(resolved.retry_backoff_max, Duration::from_secs(600));
        assert_eq!(resolved.time_limit, Some(Duration::from_secs(30)));
        assert_eq!(resolved.soft_time_limit, Some(Duration::from_secs(20)));
        assert!(!resolved.acks_late);
        assert_eq!(resolved.dead_letter_queue, "failed");
    }
}
