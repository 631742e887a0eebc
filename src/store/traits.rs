//! External persistence seam for scheduled jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::scheduler::job::{RunStatus, ScheduledJob};

/// Backend-agnostic job persistence.
///
/// The kernel reads job rows and writes run bookkeeping through this trait;
/// it never assumes durability and reconstructs its timers from the store
/// alone after a restart.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// All enabled jobs, for arming timers at startup.
    async fn list_enabled(&self) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Look up a job by id.
    async fn get(&self, id: Uuid) -> Result<Option<ScheduledJob>, StoreError>;

    /// Persist the computed next fire time.
    async fn set_next_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Mark a run as started.
    async fn record_run_started(&self, id: Uuid) -> Result<(), StoreError>;

    /// Record the outcome of a finished run.
    async fn record_run_finished(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;
}
