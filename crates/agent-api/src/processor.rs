//! Background video processing.
//!
//! Each scheduled job runs on its own tokio task, outliving the request that
//! scheduled it. Runs are tracked so that a single run, or every run at
//! shutdown, can be cancelled; a cancelled run is recorded as failed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::mcp::{McpError, VideoTool};
use crate::registry::TaskRegistry;
use crate::task::{TaskId, TaskStatus, VideoResult};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("video file not found at {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("video processing failed: {0}")]
    Tool(#[from] McpError),

    #[error("processing cancelled")]
    Cancelled,
}

/// A stored upload waiting to be processed.
#[derive(Debug, Clone)]
pub struct VideoJob {
    pub task_id: TaskId,
    pub path: PathBuf,
    /// Display title recorded with the result.
    pub title: String,
}

#[derive(Clone)]
pub struct BackgroundProcessor {
    registry: Arc<TaskRegistry>,
    tool: Arc<dyn VideoTool>,
    handles: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for BackgroundProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BackgroundProcessor({} in flight)", self.in_flight())
    }
}

impl BackgroundProcessor {
    pub fn new(registry: Arc<TaskRegistry>, tool: Arc<dyn VideoTool>) -> Self {
        Self {
            registry,
            tool,
            handles: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Registers the task as pending and starts processing it in the
    /// background. Never waits for the run itself.
    pub fn schedule(&self, job: VideoJob) {
        self.registry.create(&job.task_id);

        if self.tracker.is_closed() {
            warn!(task_id = %job.task_id, "processor is shutting down; rejecting job");
            self.registry.fail(&job.task_id, ProcessError::Cancelled.to_string());
            return;
        }

        let cancel = self.shutdown.child_token();
        self.handles().insert(job.task_id.clone(), cancel.clone());

        let this = self.clone();
        self.tracker.spawn(async move {
            let task_id = job.task_id.clone();
            this.run(job, cancel).await;
            this.handles().remove(&task_id);
        });
    }

    /// Cancels one running job. Returns `true` if it was still in flight.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let token = self.handles().remove(task_id);
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.handles().len()
    }

    /// Locks the handle table, recovering it if a holder panicked.
    fn handles(&self) -> MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops accepting jobs, cancels the running ones and waits up to
    /// `grace` for them to record their outcome.
    pub async fn shutdown(&self, grace: Duration) {
        self.tracker.close();
        self.shutdown.cancel();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                in_flight = self.in_flight(),
                "background jobs did not finish within the shutdown grace period"
            );
        }
    }

    async fn run(&self, job: VideoJob, cancel: CancellationToken) {
        let VideoJob {
            task_id,
            path,
            title,
        } = job;
        self.registry.set_status(&task_id, TaskStatus::InProgress);
        info!(task_id = %task_id, path = %path.display(), "processing video");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProcessError::Cancelled),
            outcome = self.process(&path, title) => outcome,
        };

        match outcome {
            Ok(result) => {
                info!(task_id = %task_id, video_url = %result.video_url, "video processed");
                self.registry.set_result(&task_id, result);
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "video processing failed");
                self.registry.fail(&task_id, e.to_string());
            }
        }
    }

    async fn process(&self, path: &Path, title: String) -> Result<VideoResult, ProcessError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(ProcessError::SourceMissing(path.to_path_buf()));
        }
        let video_url = self.tool.process_video(path).await?;
        Ok(VideoResult { video_url, title })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::task::TaskSnapshot;

    /// Returns a fixed reference once the gate is opened.
    struct GatedTool {
        gate: Notify,
    }

    #[async_trait]
    impl VideoTool for GatedTool {
        async fn process_video(&self, path: &Path) -> Result<String, McpError> {
            self.gate.notified().await;
            Ok(format!("processed://{}", path.display()))
        }
    }

    fn processor() -> (Arc<TaskRegistry>, Arc<GatedTool>, BackgroundProcessor) {
        let registry = Arc::new(TaskRegistry::new());
        let tool = Arc::new(GatedTool { gate: Notify::new() });
        let processor = BackgroundProcessor::new(Arc::clone(&registry), tool.clone());
        (registry, tool, processor)
    }

    async fn wait_terminal(registry: &TaskRegistry, id: &TaskId) -> TaskSnapshot {
        for _ in 0..200 {
            let snapshot = registry.get(id);
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn missing_source_fails_the_task() {
        let (registry, _tool, processor) = processor();
        let task_id = TaskId::new();
        processor.schedule(VideoJob {
            task_id: task_id.clone(),
            path: PathBuf::from("/definitely/not/here.mp4"),
            title: "here.mp4".into(),
        });

        let snapshot = wait_terminal(&registry, &task_id).await;
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert!(snapshot.result.is_none());
        assert!(snapshot.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn completes_with_tool_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"video").unwrap();

        let (registry, tool, processor) = processor();
        let task_id = TaskId::new();
        processor.schedule(VideoJob {
            task_id: task_id.clone(),
            path: path.clone(),
            title: "clip.mp4".into(),
        });
        assert_ne!(registry.get(&task_id).status, TaskStatus::NotFound);

        tool.gate.notify_one();
        let snapshot = wait_terminal(&registry, &task_id).await;
        assert_eq!(snapshot.status, TaskStatus::Completed);
        let result = snapshot.result.unwrap();
        assert_eq!(result.video_url, format!("processed://{}", path.display()));
        assert_eq!(result.title, "clip.mp4");
        assert_eq!(processor.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_run_is_recorded_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"video").unwrap();

        let (registry, _tool, processor) = processor();
        let task_id = TaskId::new();
        processor.schedule(VideoJob {
            task_id: task_id.clone(),
            path,
            title: "clip.mp4".into(),
        });

        assert!(processor.cancel(&task_id));
        let snapshot = wait_terminal(&registry, &task_id).await;
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("processing cancelled"));
        assert!(!processor.cancel(&task_id));
    }

    #[tokio::test]
    async fn poisoned_handle_table_keeps_tracking_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"video").unwrap();

        let (registry, _tool, processor) = processor();
        let handles = Arc::clone(&processor.handles);
        let _ = std::thread::spawn(move || {
            let _guard = handles.lock().unwrap();
            panic!("poison the handle table");
        })
        .join();
        assert!(processor.handles.is_poisoned());

        let task_id = TaskId::new();
        processor.schedule(VideoJob {
            task_id: task_id.clone(),
            path,
            title: "clip.mp4".into(),
        });
        assert_eq!(processor.in_flight(), 1);

        assert!(processor.cancel(&task_id));
        let snapshot = wait_terminal(&registry, &task_id).await;
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(processor.in_flight(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_jobs_and_rejects_new_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"video").unwrap();

        let (registry, _tool, processor) = processor();
        let running = TaskId::new();
        processor.schedule(VideoJob {
            task_id: running.clone(),
            path: path.clone(),
            title: "clip.mp4".into(),
        });

        processor.shutdown(Duration::from_secs(5)).await;
        assert_eq!(registry.get(&running).status, TaskStatus::Failed);

        let late = TaskId::new();
        processor.schedule(VideoJob {
            task_id: late.clone(),
            path,
            title: "clip.mp4".into(),
        });
        assert_eq!(registry.get(&late).status, TaskStatus::Failed);
    }
}
