//! JobRecord store trait with in-memory and SQLite implementations.

mod memory;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryJobStore;
pub use rmbg_types::{Completion, JobOutcome, JobRecord, JobStatus, JobStore, StoreError};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobStore;
