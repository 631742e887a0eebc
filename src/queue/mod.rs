//! Per-channel task queue.

pub mod queue;
pub mod task;

pub use queue::{TaskQueue, TaskWork};
pub use task::{CANCELLED_MESSAGE, Task, TaskEvent, TaskMetadata, TaskStatus, truncate_for_preview};
