//! In-memory priority task queue.
//!
//! Four strict priority buckets, FIFO within a bucket. The queue tracks
//! running, completed, and failed membership but enforces no concurrency
//! bound of its own; the scheduler owns that cap. A failed task is never
//! resubmitted automatically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

/// Strict task priority. Scheduling order is [`Priority::ORDERED`], not a
/// comparison order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// All priorities in dequeue order.
    pub const ORDERED: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];
}

/// The work a task carries. The queue treats it as opaque; the scheduler
/// interprets it when the task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskOperation {
    /// Activate a registered agent by name
    ActivateAgent { agent: String },
}

/// A queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub operation: TaskOperation,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Counts across the task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Priority buckets plus lifecycle membership sets.
#[derive(Debug, Default)]
pub struct TaskQueue {
    buckets: HashMap<Priority, VecDeque<Task>>,
    running: HashSet<Uuid>,
    completed: HashSet<Uuid>,
    failed: HashMap<Uuid, String>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a new task and return its id.
    pub fn add_task(&mut self, operation: TaskOperation, priority: Priority) -> Uuid {
        let task = Task {
            id: Uuid::new_v4(),
            operation,
            priority,
            created_at: Utc::now(),
            attempts: 0,
        };
        let id = task.id;
        debug!(task_id = %id, ?priority, "task enqueued");
        self.buckets.entry(priority).or_default().push_back(task);
        id
    }

    /// Pop the oldest task from the highest non-empty priority bucket.
    pub fn get_next_task(&mut self) -> Option<Task> {
        for priority in Priority::ORDERED {
            if let Some(bucket) = self.buckets.get_mut(&priority) {
                if let Some(mut task) = bucket.pop_front() {
                    task.attempts += 1;
                    return Some(task);
                }
            }
        }
        None
    }

    pub fn mark_running(&mut self, id: Uuid) {
        self.running.insert(id);
    }

    pub fn mark_completed(&mut self, id: Uuid) {
        self.running.remove(&id);
        self.completed.insert(id);
    }

    /// Record a failure. The task is not resubmitted; retry is the caller's
    /// decision.
    pub fn mark_failed(&mut self, id: Uuid, error: impl Into<String>) {
        let error = error.into();
        warn!(task_id = %id, error = %error, "task failed");
        self.running.remove(&id);
        self.failed.insert(id, error);
    }

    pub fn pending_count(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn get_stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending_count(),
            running: self.running.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
        }
    }

    /// The recorded error for a failed task, if any.
    pub fn failure_reason(&self, id: Uuid) -> Option<&str> {
        self.failed.get(&id).map(String::as_str)
    }
}
