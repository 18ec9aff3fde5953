//! HTTP client for the agent API: upload a video, poll its task until it
//! finishes, then chat about it.

use std::path::Path;
use std::time::{Duration, Instant};

use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::schema::{
    ChatRequest, ChatResponse, MessageResponse, ProcessVideoResponse, TaskStatusResponse,
};
use crate::task::TaskStatus;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cannot read upload: {0}")]
    Io(#[from] std::io::Error),

    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },

    #[error("task {0} was not found")]
    NotFound(String),

    #[error("task {task_id} still {status} after {waited:?}")]
    Timeout {
        task_id: String,
        status: TaskStatus,
        waited: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct PollOptions {
    pub interval: Duration,
    /// Give up after this long; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// How long `not_found` is tolerated after polling starts before the
    /// task is considered lost.
    pub not_found_grace: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: None,
            not_found_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Uploads the file at `path` and returns the issued task id.
    pub async fn upload(&self, path: &Path) -> Result<String, ClientError> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.mp4".to_string());

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, len)
            .file_name(file_name)
            .mime_str("video/mp4")?;
        let form = Form::new().part("file", part);

        let response = self
            .http
            .post(self.url("/process-video"))
            .multipart(form)
            .send()
            .await?;
        let accepted: ProcessVideoResponse = check(response).await?.json().await?;
        debug!(task_id = %accepted.task_id, "upload accepted");
        Ok(accepted.task_id)
    }

    pub async fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/task-status/{task_id}")))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Polls until the task reaches a terminal state. `on_update` sees every
    /// status observed along the way.
    pub async fn wait_for_completion<F>(
        &self,
        task_id: &str,
        options: &PollOptions,
        mut on_update: F,
    ) -> Result<TaskStatusResponse, ClientError>
    where
        F: FnMut(&TaskStatusResponse),
    {
        let started = Instant::now();
        loop {
            let status = self.task_status(task_id).await?;
            on_update(&status);

            match status.status {
                TaskStatus::Completed | TaskStatus::Failed => return Ok(status),
                TaskStatus::NotFound if started.elapsed() >= options.not_found_grace => {
                    return Err(ClientError::NotFound(task_id.to_string()));
                }
                _ => {}
            }

            if let Some(timeout) = options.timeout {
                if started.elapsed() >= timeout {
                    return Err(ClientError::Timeout {
                        task_id: task_id.to_string(),
                        status: status.status,
                        waited: started.elapsed(),
                    });
                }
            }
            tokio::time::sleep(options.interval).await;
        }
    }

    pub async fn chat(
        &self,
        message: &str,
        video_path: Option<&str>,
    ) -> Result<String, ClientError> {
        let request = ChatRequest {
            message: message.to_string(),
            video_path: video_path.map(str::to_string),
        };
        let response = self.http.post(self.url("/chat")).json(&request).send().await?;
        let reply: ChatResponse = check(response).await?.json().await?;
        Ok(reply.response)
    }

    pub async fn reset_memory(&self) -> Result<String, ClientError> {
        let response = self.http.post(self.url("/reset-memory")).send().await?;
        let reply: MessageResponse = check(response).await?.json().await?;
        Ok(reply.message)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Api { status, body })
}
