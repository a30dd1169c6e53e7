//! SQLite-backed job store, shared by the API process and the worker processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rmbg_types::{Completion, JobRecord, JobStatus, JobStore, StoreError};
use rusqlite::{OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed job store. The full record is kept as JSON next to an indexed status column.
pub struct SqliteJobStore {
    conn: std::sync::Mutex<rusqlite::Connection>,
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Other(e.to_string())
}

impl SqliteJobStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(db_err)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                task_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                record TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            "#,
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Other(format!("failed to acquire lock: {}", e)))?;
        f(&mut conn)
    }

    /// Read-modify-write of one record inside an IMMEDIATE transaction, so concurrent
    /// processes serialize on the same row.
    fn update<F>(&self, task_id: &str, apply: F) -> Result<JobRecord, StoreError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), StoreError>,
    {
        self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            let text: Option<String> = tx
                .query_row(
                    "SELECT record FROM jobs WHERE task_id = ?1",
                    rusqlite::params![task_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            let text = text.ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
            let mut record = decode(&text)?;
            apply(&mut record)?;
            let json = encode(&record)?;
            tx.execute(
                "UPDATE jobs SET status = ?2, record = ?3, updated_at = ?4 WHERE task_id = ?1",
                rusqlite::params![
                    task_id,
                    record.status.as_str(),
                    json,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(record)
        })
    }
}

fn encode(record: &JobRecord) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|e| StoreError::Other(e.to_string()))
}

fn decode(text: &str) -> Result<JobRecord, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Other(e.to_string()))
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, record: JobRecord) -> Result<(), StoreError> {
        let json = encode(&record)?;
        self.with_conn(|conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO jobs (task_id, status, record, updated_at) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        record.task_id,
                        record.status.as_str(),
                        json,
                        Utc::now().to_rfc3339()
                    ],
                )
                .map_err(db_err)?;
            if inserted == 0 {
                return Err(StoreError::AlreadyExists(record.task_id.clone()));
            }
            Ok(())
        })
    }

    async fn get(&self, task_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let text: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT record FROM jobs WHERE task_id = ?1",
                rusqlite::params![task_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
        })?;
        text.as_deref().map(decode).transpose()
    }

    async fn mark_processing(
        &self,
        task_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError> {
        self.update(task_id, |r| r.apply_processing(started_at))
    }

    async fn finish(
        &self,
        task_id: &str,
        completion: Completion,
    ) -> Result<JobRecord, StoreError> {
        self.update(task_id, |r| r.apply_completion(completion))
    }

    async fn discard(&self, task_id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM jobs WHERE task_id = ?1 AND status = ?2",
                    rusqlite::params![task_id, JobStatus::Pending.as_str()],
                )
                .map_err(db_err)?;
            if removed == 0 {
                return Err(StoreError::NotFound(task_id.to_string()));
            }
            Ok(())
        })
    }
}
