//! Request and response bodies of the HTTP API, shared with the polling client.

use serde::{Deserialize, Serialize};

use crate::task::{TaskSnapshot, TaskStatus, VideoResult};

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub tasks: usize,
    pub in_flight: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessVideoResponse {
    pub message: String,
    #[serde(rename = "taskId")]
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(rename = "videoUrl", default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStatusResponse {
    /// Result fields are only filled for completed tasks; a completed task
    /// without a stored result reports empty strings.
    pub fn new(task_id: impl Into<String>, snapshot: TaskSnapshot) -> Self {
        let (video_url, title) = match snapshot.status {
            TaskStatus::Completed => {
                let result = snapshot.result.unwrap_or_else(|| VideoResult {
                    video_url: String::new(),
                    title: String::new(),
                });
                (Some(result.video_url), Some(result.title))
            }
            _ => (None, None),
        };
        let error = snapshot.error.filter(|_| snapshot.status == TaskStatus::Failed);

        Self {
            task_id: task_id.into(),
            status: snapshot.status,
            video_url,
            title,
            error,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub video_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
}
