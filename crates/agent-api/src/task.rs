//! Task identity and lifecycle types shared by the registry, the HTTP layer
//! and the polling client.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque task identifier. Freshly issued ids are UUID v4 strings, but any
/// string received from a client is accepted as a lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a video-processing task.
///
/// `NotFound` is never stored; lookups synthesize it for unknown ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    NotFound,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether a stored task in state `self` may move to `next`.
    ///
    /// Repeating a non-terminal state is allowed; terminal states are final.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (_, NotFound) | (NotFound, _) => false,
            (Completed | Failed, _) => false,
            (Pending, _) => true,
            (InProgress, Pending) => false,
            (InProgress, _) => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::NotFound => "not_found",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a successful run: where the processed artifact lives and the
/// title to display for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoResult {
    pub video_url: String,
    pub title: String,
}

/// Point-in-time view of a task as returned by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub status: TaskStatus,
    pub result: Option<VideoResult>,
    pub error: Option<String>,
}

impl TaskSnapshot {
    pub fn not_found() -> Self {
        Self {
            status: TaskStatus::NotFound,
            result: None,
            error: None,
        }
    }
}
