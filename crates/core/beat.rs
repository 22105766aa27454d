//! Periodic dispatcher ("beat").
//!
//! A [`Beat`] owns a fixed [`BeatSchedule`] and sends each entry's task once
//! its interval has elapsed since the last send. When an entry last ran is
//! kept in a [`ScheduleStore`] so restarts do not reset the cadence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use crate::client::Client;
use crate::error::{CourierError, Result};
use crate::job::current_timestamp;

/// One periodic task.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    /// Unique entry name.
    pub name: String,
    /// Registered task to send.
    pub task: String,
    /// Interval between sends.
    pub every: Duration,
    /// Arguments sent with every invocation.
    pub args: Value,
}

impl ScheduleEntry {
    /// Create an entry sending `task` without arguments every `every`.
    pub fn new(name: impl Into<String>, task: impl Into<String>, every: Duration) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            every,
            args: Value::Null,
        }
    }

    /// Set the arguments.
    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    fn every_secs(&self) -> i64 {
        self.every.as_secs().max(1) as i64
    }
}

/// The set of periodic tasks, keyed by entry name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BeatSchedule {
    entries: Vec<ScheduleEntry>,
}

impl BeatSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, replacing any entry with the same name.
    pub fn entry(mut self, entry: ScheduleEntry) -> Self {
        self.entries.retain(|e| e.name != entry.name);
        self.entries.push(entry);
        self
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&ScheduleEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Persisted run state of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryState {
    /// Unix timestamp of the last send (or of first sight).
    pub last_run_at: i64,
    /// Number of sends so far.
    pub total_run_count: u64,
}

/// Persistence for beat entry state.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Load the state of every known entry.
    async fn load(&self) -> Result<HashMap<String, EntryState>>;

    /// Persist one entry's state.
    async fn save(&self, name: &str, state: &EntryState) -> Result<()>;
}

/// Non-persistent schedule store.
#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    states: Mutex<HashMap<String, EntryState>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn load(&self) -> Result<HashMap<String, EntryState>> {
        self.states
            .lock()
            .map(|states| states.clone())
            .map_err(|_| CourierError::Schedule("schedule store lock poisoned".to_string()))
    }

    async fn save(&self, name: &str, state: &EntryState) -> Result<()> {
        self.states
            .lock()
            .map_err(|_| CourierError::Schedule("schedule store lock poisoned".to_string()))?
            .insert(name.to_string(), *state);
        Ok(())
    }
}

/// Periodic dispatcher.
pub struct Beat<S: ScheduleStore> {
    client: Client,
    schedule: BeatSchedule,
    store: S,
    state: HashMap<String, EntryState>,
    max_interval: Duration,
}

impl<S: ScheduleStore> Beat<S> {
    /// Create a dispatcher sending through `client`.
    pub fn new(client: Client, schedule: BeatSchedule, store: S) -> Self {
        Self {
            client,
            schedule,
            store,
            state: HashMap::new(),
            max_interval: Duration::from_secs(5),
        }
    }

    /// Cap on how long the loop sleeps between checks.
    pub fn max_interval(mut self, max: Duration) -> Self {
        self.max_interval = max;
        self
    }

    /// Restore entry state from the store.
    pub async fn load(&mut self) -> Result<()> {
        self.state = self.store.load().await?;
        tracing::debug!(entries = self.state.len(), "Beat state loaded");
        Ok(())
    }

    /// State of an entry, if it has been seen.
    pub fn entry_state(&self, name: &str) -> Option<&EntryState> {
        self.state.get(name)
    }

    /// Send every due entry at `now`. Returns how long to sleep before the next check.
    ///
    /// An entry seen for the first time starts its interval at `now` without
    /// sending.
    pub async fn tick(&mut self, now: i64) -> Duration {
        let mut next = self.max_interval;

        let entries = self.schedule.entries().to_vec();
        for entry in &entries {
            let remaining = match self.state.get(&entry.name).copied() {
                None => {
                    let state = EntryState {
                        last_run_at: now,
                        total_run_count: 0,
                    };
                    self.persist(&entry.name, state).await;
                    entry.every_secs()
                }
                Some(state) if now >= state.last_run_at + entry.every_secs() => {
                    match self.client.send_task(&entry.task, entry.args.clone()).await {
                        Ok(job_id) => {
                            tracing::info!(
                                entry = %entry.name,
                                task = %entry.task,
                                job_id = %job_id,
                                "Sending due task"
                            );
                            let state = EntryState {
                                last_run_at: now,
                                total_run_count: state.total_run_count + 1,
                            };
                            self.persist(&entry.name, state).await;
                            entry.every_secs()
                        }
                        Err(e) => {
                            tracing::error!(
                                entry = %entry.name,
                                task = %entry.task,
                                error = %e,
                                "Failed to send due task"
                            );
                            self.max_interval.as_secs() as i64
                        }
                    }
                }
                Some(state) => state.last_run_at + entry.every_secs() - now,
            };

            let remaining = Duration::from_secs(remaining.max(0) as u64);
            next = next.min(remaining);
        }

        next.max(Duration::from_millis(100))
    }

    async fn persist(&mut self, name: &str, state: EntryState) {
        self.state.insert(name.to_string(), state);
        if let Err(e) = self.store.save(name, &state).await {
            tracing::warn!(entry = %name, error = %e, "Failed to persist beat state");
        }
    }

    /// Run until Ctrl-C.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run until `shutdown` completes.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.load().await?;
        tracing::info!(
            entries = self.schedule.len(),
            namespace = %self.client.namespace(),
            "Beat started"
        );

        tokio::pin!(shutdown);
        loop {
            let sleep = self.tick(current_timestamp()).await;
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }

        tracing::info!("Beat stopped");
        Ok(())
    }
}
