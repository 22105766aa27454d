//! Redis backend for courier.
//!
//! One `RedisBackend` serves both as broker and as result store; point two
//! instances at different databases to keep them apart.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use courier_core::Client;
//! use courier_redis::RedisBackend;
//!
//! #[tokio::main]
//! async fn main() -> courier_core::Result<()> {
//!     let broker = RedisBackend::new("redis://localhost:6379/1").await?;
//!     let results = RedisBackend::new("redis://localhost:6379/0").await?;
//!     let client = Client::new(broker, "myapp").with_results(results);
//!     client.send_task("tasks.simple_task", serde_json::json!({"message": "hi"})).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use courier_core::{Backend, CourierError, Result, ResultBackend, WorkerPoolInfo};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

/// Prefix for all courier-created keys.
const KEY_PREFIX: &str = "_courier_";

/// Shortest blocking pop; BRPOP treats 0 as "wait forever".
const MIN_BLOCK_SECS: f64 = 0.01;

fn backend_err(e: redis::RedisError) -> CourierError {
    CourierError::Backend(e.to_string())
}

/// Manages Redis keys with a namespace prefix.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    namespace: String,
}

impl RedisKeys {
    /// Create a new RedisKeys instance with the given namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Get the namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Key for the main jobs queue (LIST).
    pub fn jobs(&self) -> String {
        format!("{}{}:jobs", KEY_PREFIX, self.namespace)
    }

    /// Key for the delayed jobs sorted set (ZSET, scored by ETA).
    pub fn schedule(&self) -> String {
        format!("{}{}:schedule", KEY_PREFIX, self.namespace)
    }

    /// Key for the retry sorted set (ZSET, scored by retry time).
    pub fn retry(&self) -> String {
        format!("{}{}:retry", KEY_PREFIX, self.namespace)
    }

    /// Key for a dead-letter queue (LIST, newest first).
    pub fn dead(&self, queue: &str) -> String {
        format!("{}{}:dead:{}", KEY_PREFIX, self.namespace, queue)
    }

    /// Key for a worker pool's in-progress jobs (ZSET, scored by timestamp).
    pub fn in_progress(&self, pool_id: &str) -> String {
        format!("{}{}:in_progress:{}", KEY_PREFIX, self.namespace, pool_id)
    }

    /// Key for a stored task outcome (STRING).
    pub fn result(&self, job_id: &str) -> String {
        format!("{}{}:result:{}", KEY_PREFIX, self.namespace, job_id)
    }

    /// Key for the set of registered worker pools (SET, global).
    pub fn worker_pools() -> String {
        format!("{}worker_pools", KEY_PREFIX)
    }

    /// Key for a worker pool's heartbeat data (HASH, global).
    pub fn heartbeat(pool_id: &str) -> String {
        format!("{}heartbeat:{}", KEY_PREFIX, pool_id)
    }
}

/// Redis broker and result store.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connect to Redis.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(backend_err)?;
        let conn = ConnectionManager::new(client).await.map_err(backend_err)?;
        tracing::debug!(url = %redis_url, "Connected to Redis");
        Ok(Self { conn })
    }

    /// Create a new Redis backend with an existing connection manager.
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn zset_move_to_queue(&self, zset: &str, jobs: &str, job_json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().zrem(zset, job_json).lpush(jobs, job_json);

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn push_job(&self, ns: &str, job_json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(RedisKeys::new(ns).jobs(), job_json)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn pop_job(&self, ns: &str, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let result: Option<(String, String)> = conn
            .brpop(
                RedisKeys::new(ns).jobs(),
                timeout.as_secs_f64().max(MIN_BLOCK_SECS),
            )
            .await
            .map_err(backend_err)?;
        Ok(result.map(|(_, json)| json))
    }

    async fn pop_job_nowait(&self, ns: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let job: Option<String> = conn
            .rpop(RedisKeys::new(ns).jobs(), None)
            .await
            .map_err(backend_err)?;
        Ok(job)
    }

    async fn queue_len(&self, ns: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn
            .llen(RedisKeys::new(ns).jobs())
            .await
            .map_err(backend_err)?;
        Ok(len)
    }

    async fn schedule_job(&self, ns: &str, job_json: &str, run_at: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(RedisKeys::new(ns).schedule(), job_json, run_at)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get_due_scheduled(&self, ns: &str, now: i64, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let jobs: Vec<String> = conn
            .zrangebyscore_limit(RedisKeys::new(ns).schedule(), "-inf", now, 0, limit as isize)
            .await
            .map_err(backend_err)?;
        Ok(jobs)
    }

    async fn remove_scheduled(&self, ns: &str, job_json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(RedisKeys::new(ns).schedule(), job_json)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn schedule_len(&self, ns: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn
            .zcard(RedisKeys::new(ns).schedule())
            .await
            .map_err(backend_err)?;
        Ok(len)
    }

    async fn move_scheduled_to_queue(&self, ns: &str, job_json: &str) -> Result<()> {
        let keys = RedisKeys::new(ns);
        self.zset_move_to_queue(&keys.schedule(), &keys.jobs(), job_json)
            .await
    }

    async fn retry_job(&self, ns: &str, job_json: &str, retry_at: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(RedisKeys::new(ns).retry(), job_json, retry_at)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get_due_retries(&self, ns: &str, now: i64, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let jobs: Vec<String> = conn
            .zrangebyscore_limit(RedisKeys::new(ns).retry(), "-inf", now, 0, limit as isize)
            .await
            .map_err(backend_err)?;
        Ok(jobs)
    }

    async fn remove_retry(&self, ns: &str, job_json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(RedisKeys::new(ns).retry(), job_json)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn retry_len(&self, ns: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn
            .zcard(RedisKeys::new(ns).retry())
            .await
            .map_err(backend_err)?;
        Ok(len)
    }

    async fn move_retry_to_queue(&self, ns: &str, job_json: &str) -> Result<()> {
        let keys = RedisKeys::new(ns);
        self.zset_move_to_queue(&keys.retry(), &keys.jobs(), job_json)
            .await
    }

    async fn push_dead(&self, ns: &str, queue: &str, job_json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(RedisKeys::new(ns).dead(queue), job_json)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn dead_len(&self, ns: &str, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn
            .llen(RedisKeys::new(ns).dead(queue))
            .await
            .map_err(backend_err)?;
        Ok(len)
    }

    async fn list_dead(
        &self,
        ns: &str,
        queue: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let jobs: Vec<String> = conn
            .lrange(
                RedisKeys::new(ns).dead(queue),
                offset as isize,
                (offset + limit - 1) as isize,
            )
            .await
            .map_err(backend_err)?;
        Ok(jobs)
    }

    async fn get_dead_by_id(&self, ns: &str, queue: &str, job_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let jobs: Vec<String> = conn
            .lrange(RedisKeys::new(ns).dead(queue), 0, -1)
            .await
            .map_err(backend_err)?;

        Ok(jobs.into_iter().find(|job_json| {
            job_json.contains(job_id)
                && serde_json::from_str::<serde_json::Value>(job_json)
                    .ok()
                    .and_then(|parsed| parsed["id"].as_str().map(|id| id == job_id))
                    .unwrap_or(false)
        }))
    }

    async fn remove_dead(&self, ns: &str, queue: &str, job_json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(RedisKeys::new(ns).dead(queue), 1, job_json)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    // ========== Heartbeat Operations ==========

    async fn heartbeat(&self, info: &WorkerPoolInfo) -> Result<()> {
        let mut conn = self.conn.clone();
        let task_names_json = serde_json::to_string(&info.task_names)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd(RedisKeys::worker_pools(), &info.pool_id)
            .cmd("HSET")
            .arg(RedisKeys::heartbeat(&info.pool_id))
            .arg("heartbeat_at")
            .arg(info.heartbeat_at)
            .arg("started_at")
            .arg(info.started_at)
            .arg("concurrency")
            .arg(info.concurrency)
            .arg("host")
            .arg(&info.host)
            .arg("pid")
            .arg(info.pid)
            .arg("task_names")
            .arg(&task_names_json)
            .arg("namespace")
            .arg(&info.namespace);

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn remove_heartbeat(&self, pool_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .srem(RedisKeys::worker_pools(), pool_id)
            .del(RedisKeys::heartbeat(pool_id));

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn list_worker_pools(&self) -> Result<Vec<WorkerPoolInfo>> {
        let mut conn = self.conn.clone();
        let pool_ids: Vec<String> = conn
            .smembers(RedisKeys::worker_pools())
            .await
            .map_err(backend_err)?;

        let mut pools = Vec::with_capacity(pool_ids.len());

        for pool_id in pool_ids {
            let data: Vec<(String, String)> = conn
                .hgetall(RedisKeys::heartbeat(&pool_id))
                .await
                .map_err(backend_err)?;

            if data.is_empty() {
                continue;
            }

            let mut info = WorkerPoolInfo {
                pool_id,
                heartbeat_at: 0,
                started_at: 0,
                concurrency: 0,
                host: String::new(),
                pid: 0,
                task_names: Vec::new(),
                namespace: String::new(),
            };

            for (key, value) in data {
                match key.as_str() {
                    "heartbeat_at" => info.heartbeat_at = value.parse().unwrap_or(0),
                    "started_at" => info.started_at = value.parse().unwrap_or(0),
                    "concurrency" => info.concurrency = value.parse().unwrap_or(0),
                    "host" => info.host = value,
                    "pid" => info.pid = value.parse().unwrap_or(0),
                    "task_names" => {
                        info.task_names = serde_json::from_str(&value).unwrap_or_default()
                    }
                    "namespace" => info.namespace = value,
                    _ => {}
                }
            }

            pools.push(info);
        }

        Ok(pools)
    }

    async fn get_stale_pools(&self, threshold_secs: u64) -> Result<Vec<String>> {
        let pools = self.list_worker_pools().await?;
        let stale_before = current_timestamp() - threshold_secs as i64;

        Ok(pools
            .into_iter()
            .filter(|p| p.heartbeat_at < stale_before)
            .map(|p| p.pool_id)
            .collect())
    }

    // ========== In-Progress Job Tracking ==========

    async fn mark_in_progress(&self, ns: &str, pool_id: &str, job_json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(
            RedisKeys::new(ns).in_progress(pool_id),
            job_json,
            current_timestamp(),
        )
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn complete_in_progress(&self, ns: &str, pool_id: &str, job_json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(RedisKeys::new(ns).in_progress(pool_id), job_json)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get_in_progress_jobs(&self, ns: &str, pool_id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let jobs: Vec<String> = conn
            .zrange(RedisKeys::new(ns).in_progress(pool_id), 0, -1)
            .await
            .map_err(backend_err)?;
        Ok(jobs)
    }

    async fn cleanup_pool(&self, pool_id: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let heartbeat_key = RedisKeys::heartbeat(pool_id);

        let namespace: Option<String> = conn
            .hget(&heartbeat_key, "namespace")
            .await
            .map_err(backend_err)?;

        let Some(ns) = namespace else {
            self.remove_heartbeat(pool_id).await?;
            return Ok(Vec::new());
        };

        // read and drop the in-progress set in one transaction
        let in_progress_key = RedisKeys::new(&ns).in_progress(pool_id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrange(&in_progress_key, 0, -1)
            .del(&in_progress_key)
            .ignore()
            .srem(RedisKeys::worker_pools(), pool_id)
            .ignore()
            .del(&heartbeat_key)
            .ignore();

        let (jobs,): (Vec<String>,) = pipe.query_async(&mut conn).await.map_err(backend_err)?;

        Ok(jobs.into_iter().map(|json| (ns.clone(), json)).collect())
    }
}

#[async_trait]
impl ResultBackend for RedisBackend {
    async fn store_result(
        &self,
        ns: &str,
        job_id: &str,
        outcome_json: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = RedisKeys::new(ns).result(job_id);
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, outcome_json, ttl.as_secs().max(1))
                .await
                .map_err(backend_err)?,
            None => conn
                .set::<_, _, ()>(key, outcome_json)
                .await
                .map_err(backend_err)?,
        }
        Ok(())
    }

    async fn get_result(&self, ns: &str, job_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let outcome: Option<String> = conn
            .get(RedisKeys::new(ns).result(job_id))
            .await
            .map_err(backend_err)?;
        Ok(outcome)
    }
}

fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_keys() {
        let keys = RedisKeys::new("myapp");
        assert_eq!(keys.jobs(), "_courier_myapp:jobs");
        assert_eq!(keys.schedule(), "_courier_myapp:schedule");
        assert_eq!(keys.retry(), "_courier_myapp:retry");
        assert_eq!(keys.dead("dlq"), "_courier_myapp:dead:dlq");
    }

    #[test]
    fn test_redis_keys_namespace() {
        let keys = RedisKeys::new(String::from("production"));
        assert_eq!(keys.namespace(), "production");
    }

    #[test]
    fn test_redis_keys_complex_namespace() {
        let keys = RedisKeys::new("app:v2:queue");
        assert_eq!(keys.jobs(), "_courier_app:v2:queue:jobs");
        assert_eq!(keys.retry(), "_courier_app:v2:queue:retry");
    }

    #[test]
    fn test_redis_keys_tracking() {
        let keys = RedisKeys::new("myapp");
        assert_eq!(keys.in_progress("pool-1"), "_courier_myapp:in_progress:pool-1");
        assert_eq!(keys.result("abc"), "_courier_myapp:result:abc");
        assert_eq!(RedisKeys::worker_pools(), "_courier_worker_pools");
        assert_eq!(RedisKeys::heartbeat("pool-1"), "_courier_heartbeat:pool-1");
    }
}

// ========== Integration Tests (require Redis) ==========
