//! Error types for the relay kernel.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invoker error: {0}")]
    Invoker(#[from] InvokerError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Task-queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue limit reached for channel {channel_id}: {limit} tasks already pending")]
    Overflow { channel_id: String, limit: usize },

    #[error("Task abandoned: queued for over {minutes} minutes without starting")]
    Orphaned { minutes: u64 },
}

/// Agent-process invocation errors.
#[derive(Debug, thiserror::Error)]
pub enum InvokerError {
    #[error("Failed to spawn agent process {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent process stdout was not captured")]
    NoStdout,

    #[error("Agent process produced no output for {0:?} and was killed")]
    Inactivity(Duration),

    #[error("Agent process exceeded the {0:?} hard ceiling and was killed")]
    HardCeiling(Duration),

    #[error("Agent invocation aborted by caller")]
    Aborted,

    #[error("Agent process exited with code {code} and produced no output")]
    ProcessExit { code: i32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InvokerError {
    /// True for the watchdog failure class (inactivity or hard ceiling).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Inactivity(_) | Self::HardCeiling(_))
    }
}

/// Job-scheduling errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression {expr:?}: {message}")]
    Cron { expr: String, message: String },

    #[error("Unknown timezone: {0}")]
    Timezone(String),

    #[error("Job {id} not found")]
    JobNotFound { id: Uuid },

    #[error("Job {id} is already running")]
    AlreadyRunning { id: Uuid },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Job-store errors (external persistence seam).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Delivery collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Send to {platform}/{channel_id} failed: {reason}")]
    SendFailed {
        platform: String,
        channel_id: String,
        reason: String,
    },
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
