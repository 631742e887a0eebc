//! In-memory `JobStore` for wiring and tests. Real deployments supply a
//! database-backed implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::scheduler::job::{RunStatus, ScheduledJob};

use super::traits::JobStore;

/// Keeps job rows in a map behind an async lock.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, ScheduledJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a job row.
    pub async fn upsert(&self, job: ScheduledJob) {
        self.jobs.write().await.insert(job.id, job);
    }

    /// Remove a job row. Returns true if it existed.
    pub async fn remove(&self, id: Uuid) -> bool {
        self.jobs.write().await.remove(&id).is_some()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn list_enabled(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.values().filter(|j| j.enabled).cloned().collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledJob>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn set_next_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound { id })?;
        job.next_run_at = Some(at);
        Ok(())
    }

    async fn record_run_started(&self, id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound { id })?;
        job.last_run_status = Some(RunStatus::Running);
        job.last_run_error = None;
        Ok(())
    }

    async fn record_run_finished(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound { id })?;
        job.last_run_at = Some(started_at);
        job.last_run_status = Some(status);
        job.last_run_error = error.map(String::from);
        Ok(())
    }
}
