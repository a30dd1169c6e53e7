//! Traits for the job record store and the job queue (broker).

use crate::{Completion, JobDescriptor, JobRecord, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Durable task_id -> JobRecord mapping backing status queries.
///
/// Contract: `get` returns `Ok(None)` for unknown ids; the API maps that to 404.
/// Writes go through `JobRecord::apply_*`, so an implementation never lets a record
/// leave a terminal state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new pending record. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, record: JobRecord) -> Result<(), StoreError>;

    /// Current record for a task id.
    async fn get(&self, task_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// pending -> processing; returns the updated record.
    async fn mark_processing(
        &self,
        task_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError>;

    /// processing -> completed | failed; returns the terminal record.
    async fn finish(&self, task_id: &str, completion: Completion)
        -> Result<JobRecord, StoreError>;

    /// Remove a record that never left `pending` (submission rolled back).
    async fn discard(&self, task_id: &str) -> Result<(), StoreError>;
}

/// A leased message. Must be acknowledged once the job reached a terminal state.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    /// Lease receipt; `ack` only succeeds while it is current.
    pub receipt: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
    pub descriptor: JobDescriptor,
}

/// Durable FIFO per named queue with at-least-once delivery.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a descriptor; returns once the broker has persisted it.
    async fn enqueue(&self, queue: &str, descriptor: &JobDescriptor) -> Result<(), QueueError>;

    /// Block until a message is visible on `queue`, then lease it.
    async fn dequeue(&self, queue: &str) -> Result<Delivery, QueueError>;

    /// Acknowledge a delivery. Returns `false` if the lease expired and the message was
    /// handed to another consumer meanwhile.
    async fn ack(&self, delivery: &Delivery) -> Result<bool, QueueError>;

    /// Number of messages waiting or leased on `queue`.
    async fn depth(&self, queue: &str) -> Result<usize, QueueError>;

    /// Connectivity probe.
    async fn ping(&self) -> Result<(), QueueError>;

    /// Record that `worker` is alive.
    async fn heartbeat(&self, worker: &str) -> Result<(), QueueError>;

    /// Workers with a heartbeat newer than `within`.
    async fn live_workers(&self, within: Duration) -> Result<usize, QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid transition for job {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job store error: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("message codec error: {0}")]
    Codec(String),
}
