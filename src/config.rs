//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// System prompt attached to scheduled-job invocations, framing the run as
/// an autonomous task with no user present.
pub const JOB_SYSTEM_PROMPT: &str = "You are running as an autonomous scheduled task. \
No user is present to answer questions, so do not ask any. Complete the task described \
in the prompt and reply with a single final report of the outcome.";

/// Task-queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum pending tasks per channel before enqueue is refused.
    pub max_pending_per_channel: usize,
    /// How often the background cleanup pass runs.
    pub cleanup_interval: Duration,
    /// Terminal tasks older than this are deleted by cleanup.
    pub terminal_retention: Duration,
    /// Queued tasks older than this are force-cancelled as orphaned.
    pub orphan_threshold: Duration,
    /// Terminal tasks newer than this still show up in snapshot queries.
    pub recent_terminal_window: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending_per_channel: 10,
            cleanup_interval: Duration::from_secs(600), // 10 minutes
            terminal_retention: Duration::from_secs(3600), // 1 hour
            orphan_threshold: Duration::from_secs(1800), // 30 minutes
            recent_terminal_window: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Agent-process invoker configuration.
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    /// Program spawned for each invocation.
    pub program: String,
    /// Kill the process if no output arrives within this window.
    pub inactivity_timeout: Duration,
    /// Kill the process unconditionally after this long.
    pub hard_timeout: Duration,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            inactivity_timeout: Duration::from_secs(300), // 5 minutes
            hard_timeout: Duration::from_secs(1800),      // 30 minutes
        }
    }
}

impl InvokerConfig {
    /// Build from environment variables, falling back to defaults.
    ///
    /// `RELAY_AGENT_PROGRAM` overrides the spawned program.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(program) = std::env::var("RELAY_AGENT_PROGRAM") {
            config.program = program;
        }
        config
    }
}

/// Job-scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tool-capability config passed to every job invocation.
    pub tool_config: PathBuf,
    /// Interval between typing indicators while a job runs.
    pub typing_interval: Duration,
    /// Interval between progress notifications while a job runs.
    pub progress_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tool_config: PathBuf::from("./tools.json"),
            typing_interval: Duration::from_secs(4),
            progress_interval: Duration::from_secs(180), // 3 minutes
        }
    }
}

impl SchedulerConfig {
    /// Build from environment variables, falling back to defaults.
    ///
    /// `RELAY_TOOL_CONFIG` overrides the tool-capability config path.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("RELAY_TOOL_CONFIG") {
            config.tool_config = PathBuf::from(path);
        }
        config
    }
}
