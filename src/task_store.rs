// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Task persistence for crash recovery.
//!
//! Stores the manager's registered [`ReplicationTask`]s in SQLite so a
//! restarted process knows what it was running. Only the immutable task
//! descriptor is persisted; replication *progress* lives in the
//! checkpoints on the peers themselves, which is what makes recovery
//! safe without coordination between the two stores.
//!
//! ```text
//! register task → save descriptor → run → checkpoint on peers
//!                  (crash anywhere: descriptor says what to rerun,
//!                   peer checkpoints say from where)
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes are retried with exponential backoff (default 5
//! attempts) before surfacing the error.

use crate::config::ReplicationTask;
use crate::error::{ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_task_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Persistent registry of task descriptors, keyed by replication id.
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Open (or create) the store at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "opening task store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| ReplicationError::Config(format!("invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        Self::connect(options).await
    }

    /// Fully in-memory store for tests and ephemeral deployments.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ReplicationError::Config(format!("SQLite options: {}", e)))?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(2) // Low concurrency needed
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                rep_id TEXT PRIMARY KEY,
                descriptor TEXT NOT NULL,
                continuous INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Persist a task descriptor, replacing any previous one for its id.
    pub async fn save(&self, task: &ReplicationTask) -> Result<()> {
        let rep_id = task.replication_id();
        let descriptor = serde_json::to_string(task)
            .map_err(|e| ReplicationError::Internal(format!("task encode: {}", e)))?;
        let updated_at = chrono::Utc::now().timestamp_millis();

        execute_with_retry("save_task", || {
            sqlx::query(
                r#"
                INSERT INTO tasks (rep_id, descriptor, continuous, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(rep_id) DO UPDATE SET
                    descriptor = excluded.descriptor,
                    continuous = excluded.continuous,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&rep_id)
            .bind(&descriptor)
            .bind(task.continuous as i64)
            .bind(updated_at)
            .execute(&self.pool)
        })
        .await?;
        debug!(rep_id = %rep_id, continuous = task.continuous, "task saved");
        Ok(())
    }

    /// Remove a task descriptor. Removing an absent id is not an error.
    pub async fn remove(&self, rep_id: &str) -> Result<()> {
        execute_with_retry("remove_task", || {
            sqlx::query("DELETE FROM tasks WHERE rep_id = ?1")
                .bind(rep_id)
                .execute(&self.pool)
        })
        .await?;
        debug!(rep_id = %rep_id, "task removed");
        Ok(())
    }

    /// Load one task descriptor by replication id.
    pub async fn get(&self, rep_id: &str) -> Result<Option<ReplicationTask>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT descriptor FROM tasks WHERE rep_id = ?1")
                .bind(rep_id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((descriptor,)) => {
                let task = serde_json::from_str(&descriptor)
                    .map_err(|e| ReplicationError::Internal(format!("task decode: {}", e)))?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Load every persisted task, oldest registration first.
    pub async fn load_all(&self) -> Result<Vec<ReplicationTask>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT descriptor FROM tasks ORDER BY updated_at ASC")
                .fetch_all(&self.pool)
                .await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for (descriptor,) in rows {
            // A descriptor this process can't decode is skipped, not fatal:
            // it may have been written by a newer version
            match serde_json::from_str(&descriptor) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(error = %e, "skipping undecodable task descriptor"),
            }
        }
        Ok(tasks)
    }
}
