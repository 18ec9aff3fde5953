//! In-memory task registry.
//!
//! Entries live in a sharded concurrent map, so a background run updating
//! one task never blocks status reads or writes for unrelated tasks. The
//! registry is the only place task state is mutated and it refuses writes
//! that would move a task backwards or out of a terminal state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::task::{TaskId, TaskSnapshot, TaskStatus, VideoResult};

#[derive(Debug)]
struct TaskEntry {
    status: TaskStatus,
    result: Option<VideoResult>,
    error: Option<String>,
    updated_at: Instant,
}

impl TaskEntry {
    fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            result: None,
            error: None,
            updated_at: Instant::now(),
        }
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: DashMap<TaskId, TaskEntry>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a `Pending` entry. Returns `false` and leaves the existing
    /// entry untouched if the id is already known.
    pub fn create(&self, id: &TaskId) -> bool {
        match self.tasks.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(TaskEntry::pending());
                true
            }
        }
    }

    /// Moves a task to `status`, creating the entry if needed.
    ///
    /// Use [`set_result`](Self::set_result) and [`fail`](Self::fail) for the
    /// terminal states so their payloads are written together with them.
    pub fn set_status(&self, id: &TaskId, status: TaskStatus) -> bool {
        self.transition(id, status, None, None)
    }

    /// Stores the result and marks the task completed in one write.
    pub fn set_result(&self, id: &TaskId, result: VideoResult) -> bool {
        self.transition(id, TaskStatus::Completed, Some(result), None)
    }

    /// Marks the task failed, keeping a short description of why.
    pub fn fail(&self, id: &TaskId, error: impl Into<String>) -> bool {
        self.transition(id, TaskStatus::Failed, None, Some(error.into()))
    }

    pub fn get(&self, id: &TaskId) -> TaskSnapshot {
        self.tasks
            .get(id)
            .map(|entry| entry.snapshot())
            .unwrap_or_else(TaskSnapshot::not_found)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drops terminal entries whose last write is at least `ttl` old.
    /// Pending and in-progress tasks are never evicted.
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let mut evicted = 0;
        self.tasks.retain(|_, entry| {
            let expired = entry.status.is_terminal() && entry.updated_at.elapsed() >= ttl;
            if expired {
                evicted += 1;
            }
            !expired
        });
        evicted
    }

    fn transition(
        &self,
        id: &TaskId,
        next: TaskStatus,
        result: Option<VideoResult>,
        error: Option<String>,
    ) -> bool {
        if next == TaskStatus::NotFound {
            warn!(task_id = %id, "refusing to store the not_found status");
            return false;
        }

        let mut entry = self.tasks.entry(id.clone()).or_insert_with(TaskEntry::pending);
        if !entry.status.can_transition_to(next) {
            warn!(
                task_id = %id,
                from = %entry.status,
                to = %next,
                "ignoring invalid task transition"
            );
            return false;
        }

        debug!(task_id = %id, from = %entry.status, to = %next, "task transition");
        entry.status = next;
        entry.result = result.filter(|_| next == TaskStatus::Completed);
        entry.error = error.filter(|_| next == TaskStatus::Failed);
        entry.updated_at = Instant::now();
        true
    }
}

/// Periodically evicts expired terminal tasks until `cancel` fires.
pub fn spawn_sweeper(
    registry: Arc<TaskRegistry>,
    ttl: Duration,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let evicted = registry.evict_expired(ttl);
                    if evicted > 0 {
                        info!(evicted, remaining = registry.len(), "evicted expired tasks");
                    }
                }
            }
        }
    })
}
