//! Task data model — per-channel units of work and their lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error text recorded on a task cancelled by request.
pub const CANCELLED_MESSAGE: &str = "Task was cancelled";

/// Status of a task in its channel queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the channel's pending list.
    Queued,
    /// Currently executing (at most one per channel).
    Running,
    /// Work function resolved successfully.
    Completed,
    /// Work function failed.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Queued: start running, or cancel before ever starting
            (Queued, Running) | (Queued, Cancelled) |
            // From Running: any terminal outcome
            (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Optional observability metadata carried through with a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Single-line preview of the message that produced this task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    /// Source platform tag (e.g. "telegram", "web", "cli").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Display name of the sender, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl TaskMetadata {
    /// Set the preview text.
    pub fn with_preview(mut self, preview: impl Into<String>) -> Self {
        self.preview = Some(preview.into());
        self
    }

    /// Set the platform tag.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Set the sender display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// One queued/running/finished unit of work for one channel.
///
/// The cancellation handle lives beside this record inside the queue and is
/// never exposed through queries; consumers always get cloned snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Unique task ID.
    pub id: Uuid,
    /// Channel this task is serialized against.
    pub channel_id: String,
    /// Current status.
    pub status: TaskStatus,
    /// Result text, present iff completed.
    pub result: Option<String>,
    /// Error text, present iff failed or cancelled-with-error.
    pub error: Option<String>,
    /// When the task was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the task transitioned to running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status. Set exactly once.
    pub completed_at: Option<DateTime<Utc>>,
    /// Observability metadata.
    pub metadata: TaskMetadata,
}

impl Task {
    /// Create a new queued task.
    pub fn new(channel_id: impl Into<String>, metadata: TaskMetadata) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id: channel_id.into(),
            status: TaskStatus::Queued,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata,
        }
    }

    /// Create a task that is already failed, for work refused at enqueue time.
    pub fn failed(channel_id: impl Into<String>, metadata: TaskMetadata, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            channel_id: channel_id.into(),
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.into()),
            created_at: now,
            started_at: None,
            completed_at: Some(now),
            metadata,
        }
    }

    /// Transition to a new status, recording timestamps.
    pub fn transition(&mut self, target: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!(
                "Cannot transition task {} from {} to {}",
                self.id, self.status, target
            ));
        }

        self.status = target;

        match target {
            TaskStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
                if self.completed_at.is_none() =>
            {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }

        Ok(())
    }
}

/// Lifecycle event broadcast to queue subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task left the pending list and began executing.
    Started { channel_id: String, task: Task },
    /// A task's work function resolved successfully.
    Completed { channel_id: String, task: Task },
    /// A task's work function failed, or enqueue was refused.
    Failed { channel_id: String, task: Task },
    /// A task was cancelled, before or during execution.
    Cancelled { channel_id: String, task: Task },
}

impl TaskEvent {
    /// The task snapshot this event carries.
    pub fn task(&self) -> &Task {
        match self {
            Self::Started { task, .. }
            | Self::Completed { task, .. }
            | Self::Failed { task, .. }
            | Self::Cancelled { task, .. } => task,
        }
    }

    /// The channel the task belongs to.
    pub fn channel_id(&self) -> &str {
        match self {
            Self::Started { channel_id, .. }
            | Self::Completed { channel_id, .. }
            | Self::Failed { channel_id, .. }
            | Self::Cancelled { channel_id, .. } => channel_id,
        }
    }

    /// The event kind as a display string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// Collapse message text into a single-line preview for task metadata.
pub fn truncate_for_preview(text: &str, max_chars: usize) -> String {
    let collapsed: String = text
        .chars()
        .take(max_chars + 50)
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    // char_indices gives us byte offsets at char boundaries, so the slice is always valid UTF-8.
    if collapsed.chars().count() > max_chars {
        let byte_offset = collapsed
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(collapsed.len());
        format!("{}...", &collapsed[..byte_offset])
    } else {
        collapsed
    }
}
