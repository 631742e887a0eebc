//! Per-channel FIFO task queue — single-flight execution, cooperative
//! cancellation, backpressure, and broadcast lifecycle events.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;

use super::task::{CANCELLED_MESSAGE, Task, TaskEvent, TaskMetadata, TaskStatus};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// A unit of work: takes a cancellation token, resolves to result text.
pub type TaskWork =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<String>> + Send>;

/// A task record plus the queue-internal pieces that never leave the queue.
struct TaskEntry {
    task: Task,
    token: CancellationToken,
    work: Option<TaskWork>,
}

/// All queue state, owned by one mutex so draining decisions are atomic.
#[derive(Default)]
struct QueueState {
    /// Every known task, keyed by id.
    tasks: HashMap<Uuid, TaskEntry>,
    /// Pending task ids per channel, in enqueue order.
    pending: HashMap<String, VecDeque<Uuid>>,
    /// The single active task per channel, if any.
    active: HashMap<String, Uuid>,
}

/// Per-channel FIFO serializer for asynchronous work.
///
/// Guarantees at most one running task per channel, strict enqueue order
/// within a channel, and full concurrency across channels.
pub struct TaskQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    tx: broadcast::Sender<TaskEvent>,
    cleanup: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TaskQueue {
    /// Create a new task queue. Call [`start`](Self::start) to arm the
    /// periodic cleanup pass.
    pub fn new(config: QueueConfig) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            config,
            state: Mutex::new(QueueState::default()),
            tx,
            cleanup: Mutex::new(None),
        })
    }

    /// Subscribe to task lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Arm the background cleanup task.
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.cleanup.lock().await;
        if slot.is_some() {
            return;
        }
        let queue = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.config.cleanup_interval);
            // Skip immediate first tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                queue.run_cleanup().await;
            }
        }));
    }

    /// Enqueue a unit of work for a channel.
    ///
    /// If the channel's pending list is already at the configured maximum,
    /// nothing is enqueued: the returned task is already failed with the
    /// backpressure error, and its "failed" event fires shortly after so a
    /// caller that subscribes right after this returns still observes it.
    pub async fn enqueue(
        self: &Arc<Self>,
        channel_id: &str,
        work: TaskWork,
        metadata: TaskMetadata,
    ) -> Task {
        let mut state = self.state.lock().await;

        let depth = state.pending.get(channel_id).map_or(0, |q| q.len());
        if depth >= self.config.max_pending_per_channel {
            let err = QueueError::Overflow {
                channel_id: channel_id.to_string(),
                limit: self.config.max_pending_per_channel,
            };
            warn!(channel = %channel_id, "{err}");

            let task = Task::failed(channel_id, metadata, err.to_string());
            state.tasks.insert(
                task.id,
                TaskEntry {
                    task: task.clone(),
                    token: CancellationToken::new(),
                    work: None,
                },
            );

            let tx = self.tx.clone();
            let event = TaskEvent::Failed {
                channel_id: channel_id.to_string(),
                task: task.clone(),
            };
            // Give the caller a beat to subscribe before the event fires.
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let _ = tx.send(event);
            });

            return task;
        }

        let task = Task::new(channel_id, metadata);
        debug!(task = %task.id, channel = %channel_id, "Task enqueued");

        state
            .pending
            .entry(channel_id.to_string())
            .or_default()
            .push_back(task.id);
        state.tasks.insert(
            task.id,
            TaskEntry {
                task: task.clone(),
                token: CancellationToken::new(),
                work: Some(work),
            },
        );

        self.drain_locked(&mut state, channel_id);
        task
    }

    /// Cancel a task.
    ///
    /// A queued task is removed from its pending list and marked cancelled
    /// immediately. A running task only has its token triggered; the terminal
    /// transition happens when the work function settles. Returns false for
    /// unknown or already-terminal tasks.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        let mut state = self.state.lock().await;

        let (status, channel_id) = match state.tasks.get(&task_id) {
            Some(entry) => (entry.task.status, entry.task.channel_id.clone()),
            None => return false,
        };

        match status {
            TaskStatus::Queued => {
                if let Some(queue) = state.pending.get_mut(&channel_id) {
                    queue.retain(|id| *id != task_id);
                }
                if let Some(entry) = state.tasks.get_mut(&task_id) {
                    if let Err(e) = entry.task.transition(TaskStatus::Cancelled) {
                        warn!(task = %task_id, "{e}");
                    }
                    entry.task.error = Some(CANCELLED_MESSAGE.to_string());
                    entry.work = None;

                    info!(task = %task_id, channel = %channel_id, "Queued task cancelled");
                    let _ = self.tx.send(TaskEvent::Cancelled {
                        channel_id,
                        task: entry.task.clone(),
                    });
                }
                true
            }
            TaskStatus::Running => {
                if let Some(entry) = state.tasks.get(&task_id) {
                    info!(task = %task_id, channel = %channel_id, "Cancelling running task");
                    entry.token.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// The currently running task for a channel, if any.
    pub async fn active_task(&self, channel_id: &str) -> Option<Task> {
        let state = self.state.lock().await;
        let id = state.active.get(channel_id)?;
        state.tasks.get(id).map(|entry| entry.task.clone())
    }

    /// Number of pending (queued, not yet running) tasks for a channel.
    pub async fn pending_count(&self, channel_id: &str) -> usize {
        let state = self.state.lock().await;
        state.pending.get(channel_id).map_or(0, |q| q.len())
    }

    /// Snapshot of all non-terminal tasks, optionally including terminal
    /// tasks that finished within the recent-terminal window.
    pub async fn tasks(&self, include_recent_terminal: bool) -> Vec<Task> {
        let state = self.state.lock().await;
        let window = chrono::Duration::from_std(self.config.recent_terminal_window)
            .unwrap_or(chrono::Duration::seconds(300));
        let cutoff = Utc::now() - window;

        state
            .tasks
            .values()
            .filter(|entry| {
                if !entry.task.status.is_terminal() {
                    return true;
                }
                include_recent_terminal
                    && entry.task.completed_at.is_some_and(|at| at > cutoff)
            })
            .map(|entry| entry.task.clone())
            .collect()
    }

    /// Look up a task snapshot by id.
    pub async fn get(&self, task_id: Uuid) -> Option<Task> {
        let state = self.state.lock().await;
        state.tasks.get(&task_id).map(|entry| entry.task.clone())
    }

    /// One cleanup pass: delete terminal tasks past the retention window and
    /// force-cancel queued tasks that have sat unstarted past the orphan
    /// threshold. Returns (deleted, orphaned) counts.
    pub async fn run_cleanup(&self) -> (usize, usize) {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.config.terminal_retention)
            .unwrap_or(chrono::Duration::hours(1));
        let orphan_age = chrono::Duration::from_std(self.config.orphan_threshold)
            .unwrap_or(chrono::Duration::minutes(30));

        let mut state = self.state.lock().await;

        let before = state.tasks.len();
        state.tasks.retain(|_, entry| {
            !(entry.task.status.is_terminal()
                && entry.task.completed_at.is_some_and(|at| now - at > retention))
        });
        let deleted = before - state.tasks.len();

        let orphans: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|entry| {
                entry.task.status == TaskStatus::Queued
                    && now - entry.task.created_at > orphan_age
            })
            .map(|entry| entry.task.id)
            .collect();
        let orphaned = orphans.len();

        for task_id in orphans {
            let channel_id = match state.tasks.get(&task_id) {
                Some(entry) => entry.task.channel_id.clone(),
                None => continue,
            };
            if let Some(queue) = state.pending.get_mut(&channel_id) {
                queue.retain(|id| *id != task_id);
            }
            if let Some(entry) = state.tasks.get_mut(&task_id) {
                if let Err(e) = entry.task.transition(TaskStatus::Cancelled) {
                    warn!(task = %task_id, "{e}");
                }
                entry.task.error = Some(
                    QueueError::Orphaned {
                        minutes: self.config.orphan_threshold.as_secs() / 60,
                    }
                    .to_string(),
                );
                entry.work = None;

                warn!(task = %task_id, channel = %channel_id, "Orphaned queued task force-cancelled");
                let _ = self.tx.send(TaskEvent::Cancelled {
                    channel_id,
                    task: entry.task.clone(),
                });
            }
        }

        if deleted > 0 || orphaned > 0 {
            info!(deleted, orphaned, "Queue cleanup pass");
        }

        (deleted, orphaned)
    }

    /// Stop background cleanup and clear all state. In-flight work functions
    /// are not aborted; callers cancel their tasks explicitly before this.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.cleanup.lock().await.take() {
            handle.abort();
        }

        let mut state = self.state.lock().await;
        state.tasks.clear();
        state.pending.clear();
        state.active.clear();

        info!("Task queue shut down");
    }

    /// Start the channel's next pending task, if the channel is idle.
    ///
    /// Must be called with the state lock held: claiming the head and setting
    /// the active marker in one critical section is what keeps the channel
    /// single-flight.
    fn drain_locked(self: &Arc<Self>, state: &mut QueueState, channel_id: &str) {
        if state.active.contains_key(channel_id) {
            return;
        }

        let task_id = loop {
            let Some(queue) = state.pending.get_mut(channel_id) else {
                return;
            };
            let Some(id) = queue.pop_front() else {
                return;
            };
            if state.tasks.contains_key(&id) {
                break id;
            }
        };

        let Some(entry) = state.tasks.get_mut(&task_id) else {
            return;
        };
        if let Err(e) = entry.task.transition(TaskStatus::Running) {
            warn!(task = %task_id, "{e}");
        }
        let task = entry.task.clone();
        let token = entry.token.clone();
        let work = entry.work.take();

        state.active.insert(channel_id.to_string(), task_id);

        info!(task = %task_id, channel = %channel_id, "Task started");
        let _ = self.tx.send(TaskEvent::Started {
            channel_id: channel_id.to_string(),
            task,
        });

        let Some(work) = work else {
            // Should not happen: queued entries always carry their work.
            warn!(task = %task_id, "Task had no work function, dropping");
            state.active.remove(channel_id);
            return;
        };

        let queue = Arc::clone(self);
        let channel_id = channel_id.to_string();
        tokio::spawn(async move {
            queue.run_task(channel_id, task_id, work, token).await;
        });
    }

    /// Await one task's work function and settle it, then drain the next.
    async fn run_task(
        self: Arc<Self>,
        channel_id: String,
        task_id: Uuid,
        work: TaskWork,
        token: CancellationToken,
    ) {
        let outcome = (work)(token.clone()).await;

        let mut state = self.state.lock().await;

        // shutdown() may have cleared the record while the work was in flight
        if let Some(entry) = state.tasks.get_mut(&task_id) {
            let event = if token.is_cancelled() {
                // Cancellation wins regardless of how the work settled
                if let Err(e) = entry.task.transition(TaskStatus::Cancelled) {
                    warn!(task = %task_id, "{e}");
                }
                entry.task.error = Some(CANCELLED_MESSAGE.to_string());
                info!(task = %task_id, channel = %channel_id, "Task cancelled");
                TaskEvent::Cancelled {
                    channel_id: channel_id.clone(),
                    task: entry.task.clone(),
                }
            } else {
                match outcome {
                    Ok(result) => {
                        if let Err(e) = entry.task.transition(TaskStatus::Completed) {
                            warn!(task = %task_id, "{e}");
                        }
                        entry.task.result = Some(result);
                        info!(task = %task_id, channel = %channel_id, "Task completed");
                        TaskEvent::Completed {
                            channel_id: channel_id.clone(),
                            task: entry.task.clone(),
                        }
                    }
                    Err(error) => {
                        if let Err(e) = entry.task.transition(TaskStatus::Failed) {
                            warn!(task = %task_id, "{e}");
                        }
                        entry.task.error = Some(error.to_string());
                        warn!(task = %task_id, channel = %channel_id, error = %error, "Task failed");
                        TaskEvent::Failed {
                            channel_id: channel_id.clone(),
                            task: entry.task.clone(),
                        }
                    }
                }
            };

            let _ = self.tx.send(event);
        }

        // Clear the marker and claim the next head in the same critical
        // section, so no other runner can slip in between.
        state.active.remove(&channel_id);
        self.drain_locked(&mut state, &channel_id);
    }
}
