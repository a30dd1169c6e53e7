//! In-memory job store (process lifetime only).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rmbg_types::{Completion, JobRecord, JobStatus, JobStore, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory JobStore: records in a map behind a RwLock. Reads run concurrently,
/// writes are serialized.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    records: Arc<RwLock<HashMap<String, JobRecord>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently in `status`.
    pub async fn count_in(&self, status: JobStatus) -> usize {
        let guard = self.records.read().await;
        guard.values().filter(|r| r.status == status).count()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut guard = self.records.write().await;
        if guard.contains_key(&record.task_id) {
            return Err(StoreError::AlreadyExists(record.task_id));
        }
        guard.insert(record.task_id.clone(), record);
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let guard = self.records.read().await;
        Ok(guard.get(task_id).cloned())
    }

    async fn mark_processing(
        &self,
        task_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError> {
        let mut guard = self.records.write().await;
        let record = guard
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        record.apply_processing(started_at)?;
        Ok(record.clone())
    }

    async fn finish(
        &self,
        task_id: &str,
        completion: Completion,
    ) -> Result<JobRecord, StoreError> {
        let mut guard = self.records.write().await;
        let record = guard
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        record.apply_completion(completion)?;
        Ok(record.clone())
    }

    async fn discard(&self, task_id: &str) -> Result<(), StoreError> {
        let mut guard = self.records.write().await;
        match guard.get(task_id) {
            None => Err(StoreError::NotFound(task_id.to_string())),
            Some(r) if r.status != JobStatus::Pending => Err(StoreError::InvalidTransition {
                task_id: task_id.to_string(),
                from: r.status,
                to: JobStatus::Pending,
            }),
            Some(_) => {
                guard.remove(task_id);
                Ok(())
            }
        }
    }
}
