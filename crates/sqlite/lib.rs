//! SQLite schedule store for the courier beat.
//!
//! Keeps each periodic entry's last send time and send count in a single
//! table, so a restarted beat continues the cadence instead of starting over.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use courier_core::{Beat, BeatSchedule, Client, MemoryBackend};
//! use courier_sqlite::SqliteScheduleStore;
//!
//! #[tokio::main]
//! async fn main() -> courier_core::Result<()> {
//!     let store = SqliteScheduleStore::open("celerybeat-schedule").await?;
//!     let client = Client::new(MemoryBackend::new(), "myapp");
//!     let mut beat = Beat::new(client, BeatSchedule::new(), store);
//!     beat.run().await
//! }
//! ```

use async_trait::async_trait;
use courier_core::{CourierError, EntryState, Result, ScheduleStore};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;

const TABLE: &str = "beat_schedule";

/// SQLite-backed beat state.
#[derive(Clone)]
pub struct SqliteScheduleStore {
    pool: SqlitePool,
}

impl SqliteScheduleStore {
    /// Open (creating if needed) the schedule database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| CourierError::Schedule(format!("Failed to open SQLite: {}", e)))?;

        tracing::debug!(path = %path.as_ref().display(), "Opened beat schedule database");
        Self::with_pool(pool).await
    }

    /// Create an in-memory store (useful for testing).
    pub async fn in_memory() -> Result<Self> {
        // a single connection that never closes keeps the in-memory database alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CourierError::Schedule(format!("Failed to open SQLite: {}", e)))?;

        Self::with_pool(pool).await
    }

    /// Use an existing pool, creating the table if needed.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                name TEXT PRIMARY KEY,
                last_run_at INTEGER NOT NULL,
                total_run_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
            TABLE
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| CourierError::Schedule(format!("Failed to create schedule table: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn load(&self) -> Result<HashMap<String, EntryState>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(&format!(
            "SELECT name, last_run_at, total_run_count FROM {}",
            TABLE
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CourierError::Schedule(format!("Failed to load schedule: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|(name, last_run_at, total_run_count)| {
                let state = EntryState {
                    last_run_at,
                    total_run_count: total_run_count.max(0) as u64,
                };
                (name, state)
            })
            .collect())
    }

    async fn save(&self, name: &str, state: &EntryState) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (name, last_run_at, total_run_count) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                last_run_at = excluded.last_run_at,
                total_run_count = excluded.total_run_count
            "#,
            TABLE
        ))
        .bind(name)
        .bind(state.last_run_at)
        .bind(state.total_run_count as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| CourierError::Schedule(format!("Failed to save schedule entry: {}", e)))?;
        Ok(())
    }
}
