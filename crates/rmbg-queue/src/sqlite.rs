//! SQLite-backed queue: durable across restarts and shared between processes.

use crate::QueueConfig;
use async_trait::async_trait;
use rmbg_types::{Delivery, JobDescriptor, JobQueue, QueueError};
use rusqlite::{OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable JobQueue. Leasing runs in an IMMEDIATE transaction, so each visible message
/// goes to exactly one consumer at a time even across processes.
pub struct SqliteQueue {
    conn: std::sync::Mutex<rusqlite::Connection>,
    config: QueueConfig,
}

fn unavailable(e: rusqlite::Error) -> QueueError {
    QueueError::Unavailable(e.to_string())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct Leased {
    receipt: String,
    attempt: u32,
    payload: Result<JobDescriptor, serde_json::Error>,
}

impl SqliteQueue {
    /// Open (or create) the queue database at the given path.
    pub fn open(path: impl AsRef<Path>, config: QueueConfig) -> Result<Self, QueueError> {
        let conn = rusqlite::Connection::open(path).map_err(unavailable)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(unavailable)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(unavailable)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                task_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                visible_at INTEGER NOT NULL,
                receipt TEXT,
                attempt INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_messages_visible ON messages(queue, visible_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_receipt ON messages(receipt);

            CREATE TABLE IF NOT EXISTS workers (
                worker TEXT PRIMARY KEY,
                seen_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(unavailable)?;

        Ok(Self {
            conn: std::sync::Mutex::new(conn),
            config,
        })
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, rusqlite::Error>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| QueueError::Unavailable(format!("failed to acquire lock: {}", e)))?;
        f(&mut conn).map_err(unavailable)
    }

    fn try_lease(&self, queue: &str) -> Result<Option<Leased>, QueueError> {
        let visibility_ms = self.config.visibility_timeout.as_millis() as i64;
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ms();
            let row: Option<(i64, String, u32, Option<String>)> = tx
                .query_row(
                    "SELECT id, payload, attempt, receipt FROM messages
                     WHERE queue = ?1 AND visible_at <= ?2
                     ORDER BY id LIMIT 1",
                    rusqlite::params![queue, now],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            let Some((id, payload, attempt, previous)) = row else {
                return Ok(None);
            };
            let payload = serde_json::from_str::<JobDescriptor>(&payload);
            if payload.is_err() {
                tx.execute("DELETE FROM messages WHERE id = ?1", rusqlite::params![id])?;
                tx.commit()?;
                return Ok(Some(Leased {
                    receipt: String::new(),
                    attempt,
                    payload,
                }));
            }
            if previous.is_some() {
                tracing::warn!(message_id = id, attempt = attempt + 1, "lease expired, redelivering message");
            }
            let receipt = Uuid::new_v4().to_string();
            tx.execute(
                "UPDATE messages SET receipt = ?2, visible_at = ?3, attempt = attempt + 1 WHERE id = ?1",
                rusqlite::params![id, receipt, now + visibility_ms],
            )?;
            tx.commit()?;
            Ok(Some(Leased {
                receipt,
                attempt: attempt + 1,
                payload,
            }))
        })
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    async fn enqueue(&self, queue: &str, descriptor: &JobDescriptor) -> Result<(), QueueError> {
        let payload =
            serde_json::to_string(descriptor).map_err(|e| QueueError::Codec(e.to_string()))?;
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (queue, task_id, payload, enqueued_at, visible_at) VALUES (?1, ?2, ?3, ?4, ?4)",
                rusqlite::params![queue, descriptor.task_id, payload, now],
            )
        })?;
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Delivery, QueueError> {
        loop {
            match self.try_lease(queue)? {
                Some(Leased {
                    receipt,
                    attempt,
                    payload: Ok(descriptor),
                }) => {
                    return Ok(Delivery {
                        queue: queue.to_string(),
                        receipt,
                        attempt,
                        descriptor,
                    })
                }
                Some(Leased {
                    payload: Err(e), ..
                }) => {
                    tracing::error!(queue, error = %e, "dropped undecodable message");
                }
                None => tokio::time::sleep(self.config.poll_interval).await,
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let removed = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM messages WHERE receipt = ?1",
                rusqlite::params![delivery.receipt],
            )
        })?;
        Ok(removed == 1)
    }

    async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
        let n: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE queue = ?1",
                rusqlite::params![queue],
                |row| row.get(0),
            )
        })?;
        Ok(n as usize)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |_| Ok(())))
    }

    async fn heartbeat(&self, worker: &str) -> Result<(), QueueError> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO workers (worker, seen_at) VALUES (?1, ?2)",
                rusqlite::params![worker, now],
            )
        })?;
        Ok(())
    }

    async fn live_workers(&self, within: Duration) -> Result<usize, QueueError> {
        let since = now_ms() - within.as_millis() as i64;
        let n: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM workers WHERE seen_at >= ?1",
                rusqlite::params![since],
                |row| row.get(0),
            )
        })?;
        Ok(n as usize)
    }
}
