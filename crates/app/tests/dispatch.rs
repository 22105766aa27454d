//! End-to-end dispatch of the demonstration tasks on the in-memory backend.

use courier_app::tasks::{SIMPLE_TASK, TASK_THAT_FAILS_TO_DLQ, TASK_WITH_CUSTOM_BACKOFF};
use courier_app::{beat_schedule, registry, Settings, NAMESPACE};
use courier_core::{
    Backend, Beat, Client, Job, MemoryBackend, MemoryScheduleStore, Reaper, Registry,
    TaskContext, TaskOptions, TaskState, WorkerConfig, WorkerPool,
};
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn fast_config(settings: &Settings, pool_id: &str) -> WorkerConfig {
    let base = settings.worker_config(2);
    WorkerConfig::builder()
        .namespace(NAMESPACE)
        .num_workers(base.num_workers)
        .prefetch_multiplier(base.prefetch_multiplier)
        .accept_content(base.accept_content)
        .results(base.results)
        .fetch_timeout(Duration::from_millis(20))
        .promote_interval(Duration::from_millis(20))
        .heartbeat_interval(Duration::from_millis(50))
        .reaper_interval(Duration::from_millis(50))
        .enable_reaper(false)
        .pool_id(pool_id)
        .build()
}

/// Move every pending retry to the ready queue, ignoring its countdown.
async fn fast_forward_retries(backend: &MemoryBackend) {
    for json in backend
        .get_due_retries(NAMESPACE, i64::MAX, 100)
        .await
        .unwrap()
    {
        backend.move_retry_to_queue(NAMESPACE, &json).await.unwrap();
    }
}

#[tokio::test]
async fn test_simple_task_result_is_stored() {
    let settings = Settings::default();
    let backend = MemoryBackend::new();
    let client = Client::new(backend.clone(), NAMESPACE).with_results(backend.clone());
    let id = client
        .send_task(SIMPLE_TASK, json!({"message": "hello"}))
        .await
        .unwrap();

    let pool = WorkerPool::builder()
        .config(fast_config(&settings, "pool-simple"))
        .registry(registry(&settings))
        .backend(backend.clone())
        .results(backend.clone())
        .build()
        .unwrap();

    let waiter = client.clone();
    let wait_id = id.clone();
    pool.run_until(async move {
        while !matches!(waiter.result(&wait_id).await, Ok(Some(_))) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let outcome = client.result(&id).await.unwrap().unwrap();
    assert_eq!(outcome.state, TaskState::Success);
    assert_eq!(outcome.result, Some(json!("Processed: hello")));
}

#[tokio::test]
async fn test_failing_task_runs_three_times_then_dead_letters() {
    let settings = Settings::default();
    let backend = MemoryBackend::new();
    let client = Client::new(backend.clone(), NAMESPACE).with_results(backend.clone());
    let id = client
        .send_task(TASK_THAT_FAILS_TO_DLQ, Value::Null)
        .await
        .unwrap();

    let pool = WorkerPool::builder()
        .config(fast_config(&settings, "pool-dlq"))
        .registry(registry(&settings))
        .backend(backend.clone())
        .results(backend.clone())
        .build()
        .unwrap();

    let watcher = backend.clone();
    pool.run_until(async move {
        loop {
            fast_forward_retries(&watcher).await;
            if watcher.dead_len(NAMESPACE, "dlq").await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(client.dead_len("dlq").await.unwrap(), 1);
    assert_eq!(client.retry_len().await.unwrap(), 0);
    assert_eq!(client.queue_len().await.unwrap(), 0);

    let dead = client.dead_job("dlq", &id).await.unwrap().unwrap();
    assert_eq!(dead.retries, 2);
    assert!(dead.last_error.unwrap().contains("dead-letter queue"));

    let outcome = client.result(&id).await.unwrap().unwrap();
    assert_eq!(outcome.state, TaskState::Failure);
    assert_eq!(outcome.retries, 2);
}

#[tokio::test]
async fn test_custom_backoff_requests_growing_countdowns() {
    let registry = registry(&Settings::default());
    let task = registry.get(TASK_WITH_CUSTOM_BACKOFF).unwrap();

    let mut job = Job::new(TASK_WITH_CUSTOM_BACKOFF, json!({"attempt": 1}));
    for expected in [10, 20] {
        let err = task
            .call(TaskContext::new(&job, task.policy()), job.kwargs())
            .await
            .unwrap_err();
        assert!(err.retryable);
        assert_eq!(err.countdown, Some(Duration::from_secs(expected)));

        job.args = err.args.unwrap();
        job.retries += 1;
    }

    let value = task
        .call(TaskContext::new(&job, task.policy()), job.kwargs())
        .await
        .unwrap();
    assert_eq!(
        value,
        json!({"status": "success", "attempt": 3, "total_retries": 2})
    );
}

#[tokio::test]
async fn test_custom_backoff_end_to_end() {
    let settings = Settings::default();
    let backend = MemoryBackend::new();
    let client = Client::new(backend.clone(), NAMESPACE).with_results(backend.clone());
    let before = now();
    let id = client
        .send_task(TASK_WITH_CUSTOM_BACKOFF, json!({"attempt": 1}))
        .await
        .unwrap();

    let pool = WorkerPool::builder()
        .config(fast_config(&settings, "pool-backoff"))
        .registry(registry(&settings))
        .backend(backend.clone())
        .results(backend.clone())
        .build()
        .unwrap();

    let watcher = backend.clone();
    let waiter = client.clone();
    let wait_id = id.clone();
    pool.run_until(async move {
        // the first retry is parked for ten seconds
        while watcher.retry_len(NAMESPACE).await.unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(watcher
            .get_due_retries(NAMESPACE, before + 9, 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            watcher
                .get_due_retries(NAMESPACE, now() + 10, 10)
                .await
                .unwrap()
                .len(),
            1
        );

        loop {
            fast_forward_retries(&watcher).await;
            if let Ok(Some(outcome)) = waiter.result(&wait_id).await {
                if outcome.is_ready() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let outcome = client.result(&id).await.unwrap().unwrap();
    assert_eq!(outcome.state, TaskState::Success);
    assert_eq!(outcome.retries, 2);
    assert_eq!(outcome.result.unwrap()["attempt"], 3);
}

const BLOCKING_TASK: &str = "tasks.blocking";

/// Registry whose only task signals `started` and then never finishes.
fn blocking_registry(acks_late: bool, started: Arc<Notify>) -> Registry {
    let mut registry = Registry::new(Settings::default().task_defaults);
    registry.register(
        BLOCKING_TASK,
        TaskOptions::new().acks_late(acks_late),
        move |_ctx: TaskContext, _args: Value| {
            let started = started.clone();
            async move {
                started.notify_one();
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }
        },
    );
    registry
}

/// Kill a pool mid-execution, reap it, and return the ready queue length.
async fn queue_len_after_worker_loss(acks_late: bool, pool_id: &str) -> usize {
    let settings = Settings::default();
    let backend = MemoryBackend::new();
    let started = Arc::new(Notify::new());

    Client::new(backend.clone(), NAMESPACE)
        .send_task(BLOCKING_TASK, json!({}))
        .await
        .unwrap();

    let pool = WorkerPool::builder()
        .config(fast_config(&settings, pool_id))
        .registry(blocking_registry(acks_late, started.clone()))
        .backend(backend.clone())
        .build()
        .unwrap();

    let handle = tokio::spawn(async move { pool.run_until(std::future::pending::<()>()).await });
    started.notified().await;
    handle.abort();
    let _ = handle.await;

    assert_eq!(backend.queue_len(NAMESPACE).await.unwrap(), 0);

    let reaper = Reaper::new(
        backend.clone(),
        Arc::new(blocking_registry(acks_late, started)),
        Duration::from_secs(30),
        Duration::from_secs(60),
        Arc::new(AtomicBool::new(true)),
    );
    reaper.recover_pool(pool_id).await.unwrap();

    backend.queue_len(NAMESPACE).await.unwrap()
}

#[tokio::test]
async fn test_late_ack_job_is_redelivered_after_worker_loss() {
    assert_eq!(queue_len_after_worker_loss(true, "pool-late").await, 1);
}

#[tokio::test]
async fn test_early_ack_job_is_not_redelivered_after_worker_loss() {
    assert_eq!(queue_len_after_worker_loss(false, "pool-early").await, 0);
}

#[tokio::test]
async fn test_beat_sends_periodic_task_after_interval() {
    let backend = MemoryBackend::new();
    let mut beat = Beat::new(
        Client::new(backend.clone(), NAMESPACE),
        beat_schedule(),
        MemoryScheduleStore::new(),
    );

    beat.tick(1_000).await;
    beat.tick(1_029).await;
    assert_eq!(backend.queue_len(NAMESPACE).await.unwrap(), 0);

    beat.tick(1_030).await;
    assert_eq!(backend.queue_len(NAMESPACE).await.unwrap(), 1);

    let json = backend.pop_job_nowait(NAMESPACE).await.unwrap().unwrap();
    let job = Job::from_json(&json).unwrap();
    assert_eq!(job.name, "tasks.periodic_task");
}

#[test]
fn test_broker_host_from_lookup() {
    let settings = Settings::from_lookup(|key| {
        (key == "CELERY_BROKER_HOST").then(|| "broker".to_string())
    });
    assert!(settings.broker_url.contains("broker"));
    assert_eq!(settings.result_backend_url, "redis://localhost:6379/0");
}
