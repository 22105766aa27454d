//! Task registry: named handlers with their resolved execution policy.
//!
//! Handlers are plain async functions taking a [`TaskContext`] and their
//! deserialized arguments:
//!
//! ```rust,ignore
//! let mut registry = Registry::new(TaskPolicy::default());
//! registry.register(
//!     "tasks.greet",
//!     TaskOptions::new().max_retries(2),
//!     |_ctx: TaskContext, args: GreetArgs| async move {
//!         Ok(serde_json::json!(format!("hello {}", args.name)))
//!     },
//! );
//! ```

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::job::{Job, JobId};
use crate::policy::{TaskOptions, TaskPolicy};

/// Result type for task handlers.
pub type JobResult = std::result::Result<Value, JobError>;

/// Boxed future returned by a type-erased handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;

type Handler = Arc<dyn Fn(TaskContext, Value) -> HandlerFuture + Send + Sync>;

/// Error returned from task handlers.
#[derive(Debug)]
pub struct JobError {
    /// Error message.
    pub message: String,
    /// Whether the job may be retried under its policy.
    pub retryable: bool,
    /// Explicit delay before the retry, overriding the policy's backoff.
    pub countdown: Option<Duration>,
    /// Replacement arguments for the retried delivery.
    pub args: Option<Value>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            countdown: None,
            args: None,
        }
    }

    /// Create a new non-retryable error (job goes straight to the dead-letter queue).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::retryable(message)
        }
    }

    /// Retry after `countdown` instead of the policy delay.
    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    /// Retry with different arguments.
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Per-delivery information handed to a handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    job_id: JobId,
    task: String,
    retries: u32,
    max_retries: u32,
    started_at: Instant,
    soft_deadline: Option<Instant>,
}

impl TaskContext {
    /// Build the context for delivering `job` under `policy`, starting now.
    pub fn new(job: &Job, policy: &TaskPolicy) -> Self {
        let started_at = Instant::now();
        Self {
            job_id: job.id.clone(),
            task: job.name.clone(),
            retries: job.retries,
            max_retries: policy.max_retries,
            started_at,
            soft_deadline: policy.soft_time_limit.map(|limit| started_at + limit),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// Retries already performed for this job.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// 1-based number of the current delivery.
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Time since this delivery started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Resolves once the soft time limit is exceeded; never resolves without one.
    pub async fn soft_time_limit(&self) {
        match self.soft_deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Whether the soft time limit has already passed.
    pub fn soft_time_limit_exceeded(&self) -> bool {
        self.soft_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Request a retry using the task's retry policy.
    pub fn retry(&self, err: impl Into<JobError>) -> JobError {
        let err = err.into();
        tracing::debug!(
            job_id = %self.job_id,
            task = %self.task,
            attempt = self.attempt(),
            error = %err.message,
            "Retry requested"
        );
        JobError {
            retryable: true,
            ..err
        }
    }

    /// Request a retry after an explicit countdown.
    pub fn retry_after(&self, err: impl Into<JobError>, countdown: Duration) -> JobError {
        self.retry(err).with_countdown(countdown)
    }
}

/// A registered task: name, resolved policy and type-erased handler.
#[derive(Clone)]
pub struct RegisteredTask {
    name: String,
    policy: TaskPolicy,
    handler: Handler,
}

impl RegisteredTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &TaskPolicy {
        &self.policy
    }

    /// Invoke the handler with raw JSON arguments.
    pub fn call(&self, ctx: TaskContext, args: Value) -> HandlerFuture {
        (self.handler)(ctx, args)
    }
}

impl std::fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Registry of invokable tasks sharing a default policy.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    defaults: TaskPolicy,
    tasks: HashMap<String, RegisteredTask>,
}

impl Registry {
    /// Create an empty registry with the given default policy.
    pub fn new(defaults: TaskPolicy) -> Self {
        Self {
            defaults,
            tasks: HashMap::new(),
        }
    }

    /// The default policy tasks inherit from.
    pub fn defaults(&self) -> &TaskPolicy {
        &self.defaults
    }

    /// Register a handler under `name`, replacing any previous registration.
    ///
    /// Arguments that fail to deserialize into `A` fail the job fatally.
    pub fn register<A, F, Fut>(
        &mut self,
        name: impl Into<String>,
        options: TaskOptions,
        handler: F,
    ) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(TaskContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let name = name.into();
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |ctx: TaskContext, args: Value| -> HandlerFuture {
            let handler = handler.clone();
            Box::pin(async move {
                let args: A = serde_json::from_value(args)
                    .map_err(|e| JobError::fatal(format!("invalid arguments: {}", e)))?;
                handler(ctx, args).await
            })
        });

        tracing::debug!(task = %name, "Task registered");
        let task = RegisteredTask {
            name: name.clone(),
            policy: options.resolve(&self.defaults),
            handler: erased,
        };
        self.tasks.insert(name, task);
        self
    }

    /// Look up a task by name.
    pub fn get(&self, name: &str) -> Option<&RegisteredTask> {
        self.tasks.get(name)
    }

    /// Policy for `name`, falling back to the defaults for unknown tasks.
    pub fn policy_for(&self, name: &str) -> &TaskPolicy {
        self.get(name).map_or(&self.defaults, |t| t.policy())
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct EchoArgs {
        message: String,
    }

    fn echo_registry() -> Registry {
        let mut registry = Registry::new(TaskPolicy::default());
        registry.register(
            "tasks.echo",
            TaskOptions::new().max_retries(7),
            |_ctx: TaskContext, args: EchoArgs| async move { Ok(json!(args.message)) },
        );
        registry
    }

    #[test]
    fn test_register_resolves_policy() {
        let registry = echo_registry();
        let task = registry.get("tasks.echo").unwrap();
        assert_eq!(task.name(), "tasks.echo");
        assert_eq!(task.policy().max_retries, 7);
        assert_eq!(registry.policy_for("tasks.missing"), registry.defaults());
        assert_eq!(registry.names(), vec!["tasks.echo"]);
    }

    #[tokio::test]
    async fn test_call_deserializes_args() {
        let registry = echo_registry();
        let task = registry.get("tasks.echo").unwrap();
        let job = Job::new("tasks.echo", json!({"message": "hi"}));
        let ctx = TaskContext::new(&job, task.policy());

        let value = task.call(ctx, job.kwargs()).await.unwrap();
        assert_eq!(value, json!("hi"));
    }

    #[tokio::test]
    async fn test_invalid_args_are_fatal() {
        let registry = echo_registry();
        let task = registry.get("tasks.echo").unwrap();
        let job = Job::new("tasks.echo", json!({"wrong": 1}));
        let ctx = TaskContext::new(&job, task.policy());

        let err = task.call(ctx, job.kwargs()).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.starts_with("invalid arguments"));
    }

    #[test]
    fn test_std_errors_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: JobError = io.into();
        assert!(err.retryable);
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_retry_after_sets_countdown() {
        let job = Job::new("tasks.echo", Value::Null);
        let ctx = TaskContext::new(&job, &TaskPolicy::default());
        let err = ctx
            .retry_after(JobError::fatal("nope"), Duration::from_secs(10))
            .with_args(json!({"attempt": 2}));

        assert!(err.retryable);
        assert_eq!(err.countdown, Some(Duration::from_secs(10)));
        assert_eq!(err.args, Some(json!({"attempt": 2})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_time_limit_fires() {
        let job = Job::new("tasks.echo", Value::Null);
        let policy = TaskPolicy {
            soft_time_limit: Some(Duration::from_secs(20)),
            ..TaskPolicy::default()
        };
        let ctx = TaskContext::new(&job, &policy);
        assert!(!ctx.soft_time_limit_exceeded());

        ctx.soft_time_limit().await;
        assert!(ctx.soft_time_limit_exceeded());
        assert!(ctx.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_soft_time_limit_never_fires() {
        let job = Job::new("tasks.echo", Value::Null);
        let ctx = TaskContext::new(&job, &TaskPolicy::default());
        let fired = tokio::time::timeout(Duration::from_secs(3600), ctx.soft_time_limit()).await;
        assert!(fired.is_err());
    }
}
