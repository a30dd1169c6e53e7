//! Job queue (broker) with in-memory and SQLite implementations.
//!
//! Both implementations lease a message for a visibility timeout on `dequeue`; a lease
//! that is not acknowledged in time makes the message visible again (at-least-once).

mod memory;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryQueue;
pub use rmbg_types::{Delivery, JobDescriptor, JobQueue, QueueError};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteQueue;

use std::time::Duration;

/// Lease length and poll cadence shared by the implementations.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl QueueConfig {
    /// `QUEUE_VISIBILITY_TIMEOUT_SECS`, `QUEUE_POLL_INTERVAL_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let parse = |key: &str| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
        };
        Self {
            visibility_timeout: parse("QUEUE_VISIBILITY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.visibility_timeout),
            poll_interval: parse("QUEUE_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        }
    }
}
