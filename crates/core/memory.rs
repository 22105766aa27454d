//! In-memory backend.
//!
//! Thread-safe broker and result store for tests and local development.
//! Nothing survives a restart. Clones share the same state, so one value can
//! serve a client, a worker pool and the result side at once.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::backend::{Backend, ResultBackend, WorkerPoolInfo};
use crate::error::{CourierError, Result};
use crate::job::current_timestamp;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Namespace {
    jobs: VecDeque<String>,
    scheduled: Vec<(i64, String)>,
    retries: Vec<(i64, String)>,
    dead: HashMap<String, VecDeque<String>>,
    in_progress: HashMap<String, Vec<String>>,
}

struct StoredResult {
    json: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    namespaces: HashMap<String, Namespace>,
    pools: HashMap<String, WorkerPoolInfo>,
    results: HashMap<(String, String), StoredResult>,
}

impl State {
    fn ns(&mut self, ns: &str) -> &mut Namespace {
        self.namespaces.entry(ns.to_string()).or_default()
    }
}

/// In-memory broker and result store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<RwLock<State>>,
}

impl MemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| CourierError::Backend("memory backend lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| CourierError::Backend("memory backend lock poisoned".to_string()))
    }
}

fn take_due(set: &[(i64, String)], now: i64, limit: usize) -> Vec<String> {
    let mut due: Vec<&(i64, String)> = set.iter().filter(|(at, _)| *at <= now).collect();
    due.sort_by_key(|(at, _)| *at);
    due.into_iter().take(limit).map(|(_, json)| json.clone()).collect()
}

fn remove_member(set: &mut Vec<(i64, String)>, job_json: &str) {
    set.retain(|(_, json)| json != job_json);
}

fn dead_job_id(job_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(job_json).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn push_job(&self, ns: &str, job_json: &str) -> Result<()> {
        self.write()?.ns(ns).jobs.push_back(job_json.to_string());
        Ok(())
    }

    async fn pop_job(&self, ns: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(job_json) = self.pop_job_nowait(ns).await? {
                return Ok(Some(job_json));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn pop_job_nowait(&self, ns: &str) -> Result<Option<String>> {
        Ok(self.write()?.ns(ns).jobs.pop_front())
    }

    async fn queue_len(&self, ns: &str) -> Result<usize> {
        Ok(self
            .read()?
            .namespaces
            .get(ns)
            .map_or(0, |n| n.jobs.len()))
    }

    async fn schedule_job(&self, ns: &str, job_json: &str, run_at: i64) -> Result<()> {
        let mut state = self.write()?;
        let scheduled = &mut state.ns(ns).scheduled;
        remove_member(scheduled, job_json);
        scheduled.push((run_at, job_json.to_string()));
        Ok(())
    }

    async fn get_due_scheduled(&self, ns: &str, now: i64, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .read()?
            .namespaces
            .get(ns)
            .map_or_else(Vec::new, |n| take_due(&n.scheduled, now, limit)))
    }

    async fn remove_scheduled(&self, ns: &str, job_json: &str) -> Result<()> {
        remove_member(&mut self.write()?.ns(ns).scheduled, job_json);
        Ok(())
    }

    async fn schedule_len(&self, ns: &str) -> Result<usize> {
        Ok(self
            .read()?
            .namespaces
            .get(ns)
            .map_or(0, |n| n.scheduled.len()))
    }

    async fn move_scheduled_to_queue(&self, ns: &str, job_json: &str) -> Result<()> {
        let mut state = self.write()?;
        let namespace = state.ns(ns);
        remove_member(&mut namespace.scheduled, job_json);
        namespace.jobs.push_back(job_json.to_string());
        Ok(())
    }

    async fn retry_job(&self, ns: &str, job_json: &str, retry_at: i64) -> Result<()> {
        let mut state = self.write()?;
        let retries = &mut state.ns(ns).retries;
        remove_member(retries, job_json);
        retries.push((retry_at, job_json.to_string()));
        Ok(())
    }

    async fn get_due_retries(&self, ns: &str, now: i64, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .read()?
            .namespaces
            .get(ns)
            .map_or_else(Vec::new, |n| take_due(&n.retries, now, limit)))
    }

    async fn remove_retry(&self, ns: &str, job_json: &str) -> Result<()> {
        remove_member(&mut self.write()?.ns(ns).retries, job_json);
        Ok(())
    }

    async fn retry_len(&self, ns: &str) -> Result<usize> {
        Ok(self
            .read()?
            .namespaces
            .get(ns)
            .map_or(0, |n| n.retries.len()))
    }

    async fn move_retry_to_queue(&self, ns: &str, job_json: &str) -> Result<()> {
        let mut state = self.write()?;
        let namespace = state.ns(ns);
        remove_member(&mut namespace.retries, job_json);
        namespace.jobs.push_back(job_json.to_string());
        Ok(())
    }

    async fn push_dead(&self, ns: &str, queue: &str, job_json: &str) -> Result<()> {
        self.write()?
            .ns(ns)
            .dead
            .entry(queue.to_string())
            .or_default()
            .push_front(job_json.to_string());
        Ok(())
    }

    async fn dead_len(&self, ns: &str, queue: &str) -> Result<usize> {
        Ok(self
            .read()?
            .namespaces
            .get(ns)
            .and_then(|n| n.dead.get(queue))
            .map_or(0, VecDeque::len))
    }

    async fn list_dead(
        &self,
        ns: &str,
        queue: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<String>> {
        Ok(self
            .read()?
            .namespaces
            .get(ns)
            .and_then(|n| n.dead.get(queue))
            .map(|dead| dead.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_dead_by_id(&self, ns: &str, queue: &str, job_id: &str) -> Result<Option<String>> {
        Ok(self
            .read()?
            .namespaces
            .get(ns)
            .and_then(|n| n.dead.get(queue))
            .and_then(|dead| {
                dead.iter()
                    .find(|json| dead_job_id(json).as_deref() == Some(job_id))
                    .cloned()
            }))
    }

    async fn remove_dead(&self, ns: &str, queue: &str, job_json: &str) -> Result<()> {
        if let Some(dead) = self.write()?.ns(ns).dead.get_mut(queue) {
            dead.retain(|json| json != job_json);
        }
        Ok(())
    }

    async fn heartbeat(&self, info: &WorkerPoolInfo) -> Result<()> {
        self.write()?
            .pools
            .insert(info.pool_id.clone(), info.clone());
        Ok(())
    }

    async fn remove_heartbeat(&self, pool_id: &str) -> Result<()> {
        self.write()?.pools.remove(pool_id);
        Ok(())
    }

    async fn list_worker_pools(&self) -> Result<Vec<WorkerPoolInfo>> {
        let mut pools: Vec<WorkerPoolInfo> = self.read()?.pools.values().cloned().collect();
        pools.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));
        Ok(pools)
    }

    async fn get_stale_pools(&self, threshold_secs: u64) -> Result<Vec<String>> {
        let cutoff = current_timestamp() - threshold_secs as i64;
        Ok(self
            .read()?
            .pools
            .values()
            .filter(|p| p.heartbeat_at < cutoff)
            .map(|p| p.pool_id.clone())
            .collect())
    }

    async fn mark_in_progress(&self, ns: &str, pool_id: &str, job_json: &str) -> Result<()> {
        self.write()?
            .ns(ns)
            .in_progress
            .entry(pool_id.to_string())
            .or_default()
            .push(job_json.to_string());
        Ok(())
    }

    async fn complete_in_progress(&self, ns: &str, pool_id: &str, job_json: &str) -> Result<()> {
        if let Some(jobs) = self.write()?.ns(ns).in_progress.get_mut(pool_id) {
            if let Some(pos) = jobs.iter().position(|json| json == job_json) {
                jobs.remove(pos);
            }
        }
        Ok(())
    }

    async fn get_in_progress_jobs(&self, ns: &str, pool_id: &str) -> Result<Vec<String>> {
        Ok(self
            .read()?
            .namespaces
            .get(ns)
            .and_then(|n| n.in_progress.get(pool_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn cleanup_pool(&self, pool_id: &str) -> Result<Vec<(String, String)>> {
        let mut state = self.write()?;
        state.pools.remove(pool_id);

        let mut recovered = Vec::new();
        for (ns, namespace) in state.namespaces.iter_mut() {
            if let Some(jobs) = namespace.in_progress.remove(pool_id) {
                recovered.extend(jobs.into_iter().map(|json| (ns.clone(), json)));
            }
        }
        Ok(recovered)
    }
}

#[async_trait]
impl ResultBackend for MemoryBackend {
    async fn store_result(
        &self,
        ns: &str,
        job_id: &str,
        outcome_json: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let stored = StoredResult {
            json: outcome_json.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.write()?
            .results
            .insert((ns.to_string(), job_id.to_string()), stored);
        Ok(())
    }

    async fn get_result(&self, ns: &str, job_id: &str) -> Result<Option<String>> {
        let mut state = self.write()?;
        let key = (ns.to_string(), job_id.to_string());
        let expired = state
            .results
            .get(&key)
            .and_then(|r| r.expires_at)
            .is_some_and(|at| Instant::now() >= at);
        if expired {
            state.results.remove(&key);
            return Ok(None);
        }
        Ok(state.results.get(&key).map(|r| r.json.clone()))
    }
}
