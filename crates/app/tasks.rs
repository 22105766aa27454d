//! Demonstration tasks.
//!
//! Each task is a plain async function registered under `tasks.<name>` with
//! its own policy overrides on top of [`Settings::task_defaults`].

use courier_core::{JobError, JobResult, Registry, TaskContext, TaskOptions};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::LazyLock;
use std::time::Duration;

use crate::settings::Settings;

pub const PERIODIC_TASK: &str = "tasks.periodic_task";
pub const SIMPLE_TASK: &str = "tasks.simple_task";
pub const TASK_WITH_RETRY: &str = "tasks.task_with_retry";
pub const TASK_THAT_FAILS_TO_DLQ: &str = "tasks.task_that_fails_to_dlq";
pub const TASK_WITH_CUSTOM_BACKOFF: &str = "tasks.task_with_custom_backoff";
pub const TASK_WITH_TIMEOUT: &str = "tasks.task_with_timeout";
pub const TASK_WITH_ACK_LATE: &str = "tasks.task_with_ack_late";

const PERIODIC_URL: &str = "https://www.google.com";

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title pattern is valid")
});

/// Build the registry holding every demonstration task.
pub fn registry(settings: &Settings) -> Registry {
    let mut registry = Registry::new(settings.task_defaults.clone());

    registry
        .register(PERIODIC_TASK, TaskOptions::new(), periodic_task)
        .register(SIMPLE_TASK, TaskOptions::new(), simple_task)
        .register(
            TASK_WITH_RETRY,
            TaskOptions::new()
                .max_retries(3)
                .retry_delay(Duration::from_secs(60))
                .retry_backoff(true)
                .retry_backoff_max(Duration::from_secs(600)),
            task_with_retry,
        )
        .register(
            TASK_THAT_FAILS_TO_DLQ,
            TaskOptions::new()
                .max_retries(2)
                .retry_delay(Duration::from_secs(30))
                .retry_backoff(true)
                .dead_letter_queue("dlq"),
            task_that_fails_to_dlq,
        )
        .register(
            TASK_WITH_CUSTOM_BACKOFF,
            TaskOptions::new().max_retries(5),
            task_with_custom_backoff,
        )
        .register(
            TASK_WITH_TIMEOUT,
            TaskOptions::new()
                .time_limit(Duration::from_secs(30))
                .soft_time_limit(Duration::from_secs(20)),
            task_with_timeout,
        )
        .register(
            TASK_WITH_ACK_LATE,
            TaskOptions::new().acks_late(true),
            task_with_ack_late,
        );

    registry
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, JobError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Text of the first `<title>` element, trimmed.
pub fn extract_title(html: &str) -> Option<String> {
    let title = TITLE_RE.captures(html)?.get(1)?.as_str().trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct NoArgs {}

/// Fetch a fixed page and report its title.
pub async fn periodic_task(ctx: TaskContext, _args: NoArgs) -> JobResult {
    tracing::info!(job_id = %ctx.job_id(), url = PERIODIC_URL, "Fetching page");

    let body = http_client(Duration::from_secs(10))?
        .get(PERIODIC_URL)
        .send()
        .await?
        .text()
        .await?;

    let title = extract_title(&body).unwrap_or_else(|| "No title found".to_string());
    tracing::info!(job_id = %ctx.job_id(), title = %title, "Page fetched");
    Ok(json!({ "title": title }))
}

#[derive(Debug, Deserialize)]
pub struct SimpleArgs {
    pub message: String,
}

pub async fn simple_task(ctx: TaskContext, args: SimpleArgs) -> JobResult {
    tracing::info!(job_id = %ctx.job_id(), message = %args.message, "Processing message");
    Ok(json!(format!("Processed: {}", args.message)))
}

#[derive(Debug, Deserialize)]
pub struct RetryArgs {
    pub url: String,
}

/// GET `url`, retrying on any transport error or error status.
pub async fn task_with_retry(ctx: TaskContext, args: RetryArgs) -> JobResult {
    tracing::info!(
        job_id = %ctx.job_id(),
        url = %args.url,
        attempt = ctx.attempt(),
        "Requesting URL"
    );

    let response = http_client(Duration::from_secs(5))?
        .get(&args.url)
        .send()
        .await
        .and_then(|response| response.error_for_status());

    match response {
        Ok(response) => Ok(json!({
            "status": "success",
            "url": args.url,
            "status_code": response.status().as_u16(),
        })),
        Err(e) => {
            tracing::warn!(job_id = %ctx.job_id(), url = %args.url, error = %e, "Request failed");
            Err(ctx.retry(e))
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct FailArgs {
    #[serde(default = "default_true")]
    pub should_fail: bool,
}

/// Fails while `should_fail` is set, ending up in the dead-letter queue.
pub async fn task_that_fails_to_dlq(ctx: TaskContext, args: FailArgs) -> JobResult {
    tracing::info!(
        job_id = %ctx.job_id(),
        attempt = ctx.attempt(),
        should_fail = args.should_fail,
        "Running failing task"
    );

    if args.should_fail {
        return Err(JobError::retryable(
            "Task failed intentionally to demonstrate the dead-letter queue",
        ));
    }

    Ok(json!({
        "status": "success",
        "message": "Task completed without failure",
    }))
}

fn default_attempt() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct BackoffArgs {
    #[serde(default = "default_attempt")]
    pub attempt: u32,
}

/// Succeeds on its third attempt, waiting `10 * (retries + 1)` seconds between tries.
pub async fn task_with_custom_backoff(ctx: TaskContext, args: BackoffArgs) -> JobResult {
    tracing::info!(
        job_id = %ctx.job_id(),
        attempt = args.attempt,
        retries = ctx.retries(),
        "Running custom backoff task"
    );

    if args.attempt < 3 {
        let countdown = Duration::from_secs(10 * (u64::from(ctx.retries()) + 1));
        let err = JobError::retryable(format!("Attempt {} failed", args.attempt));
        return Err(ctx
            .retry_after(err, countdown)
            .with_args(json!({ "attempt": args.attempt + 1 })));
    }

    Ok(json!({
        "status": "success",
        "attempt": args.attempt,
        "total_retries": ctx.retries(),
    }))
}

fn default_duration() -> u64 {
    25
}

#[derive(Debug, Deserialize)]
pub struct TimeoutArgs {
    /// Seconds to sleep.
    #[serde(default = "default_duration")]
    pub duration: u64,
}

/// Sleep for `duration` seconds, giving up cleanly at the soft time limit.
pub async fn task_with_timeout(ctx: TaskContext, args: TimeoutArgs) -> JobResult {
    tracing::info!(job_id = %ctx.job_id(), duration = args.duration, "Sleeping");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration)) => Ok(json!({
            "status": "success",
            "duration": args.duration,
            "elapsed": ctx.elapsed().as_secs_f64(),
        })),
        _ = ctx.soft_time_limit() => {
            tracing::warn!(job_id = %ctx.job_id(), "Soft time limit exceeded, cleaning up");
            Ok(json!({
                "status": "timeout",
                "error": "Soft time limit exceeded",
                "elapsed": ctx.elapsed().as_secs_f64(),
            }))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AckLateArgs {
    #[serde(default)]
    pub data: Value,
}

pub async fn task_with_ack_late(ctx: TaskContext, args: AckLateArgs) -> JobResult {
    tracing::info!(job_id = %ctx.job_id(), "Processing with late acknowledgment");
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(json!({
        "status": "success",
        "processed": args.data,
    }))
}
