use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::{Path as UrlPath, State};
use axum::routing::get;
use axum::{Json, Router};
use reqwest::StatusCode;
use serde_json::{json, Value};

use vidchat_agent_api::agent::{Agent, AgentError};
use vidchat_agent_api::client::{ApiClient, ClientError, PollOptions};
use vidchat_agent_api::mcp::{McpError, VideoTool};
use vidchat_agent_api::registry::TaskRegistry;
use vidchat_agent_api::task::TaskStatus;
use vidchat_agent_api::{build_router, AppState};

enum Behavior {
    Succeed,
    Fail,
    Hang,
}

struct FakeTool {
    behavior: Behavior,
}

#[async_trait]
impl VideoTool for FakeTool {
    async fn process_video(&self, path: &Path) -> Result<String, McpError> {
        match self.behavior {
            Behavior::Succeed => Ok(format!(
                "https://cdn.example/{}",
                path.file_name().unwrap().to_string_lossy()
            )),
            Behavior::Fail => Err(McpError::Tool {
                tool: "process_video".into(),
                message: "unsupported codec".into(),
            }),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

struct FakeAgent {
    fail: bool,
}

#[async_trait]
impl Agent for FakeAgent {
    async fn setup(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn chat(&self, message: &str, video_path: Option<&str>) -> Result<String, AgentError> {
        if self.fail {
            return Err(AgentError::Api {
                status: 429,
                body: "rate limited".into(),
            });
        }
        Ok(format!("{message} ({})", video_path.unwrap_or("no video")))
    }

    async fn reset_memory(&self) {}
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Serves the real router; the returned directory holds uploads.
async fn spawn_api(behavior: Behavior, agent_fails: bool) -> (ApiClient, tempfile::TempDir) {
    let upload_dir = tempfile::tempdir().unwrap();
    let state = AppState::new(
        Arc::new(TaskRegistry::new()),
        Arc::new(FakeTool { behavior }),
        Arc::new(FakeAgent { fail: agent_fails }),
        upload_dir.path().to_path_buf(),
        1024 * 1024,
    );
    let base_url = serve(build_router(state, &[])).await;
    (ApiClient::new(base_url), upload_dir)
}

fn fast_polling() -> PollOptions {
    PollOptions {
        interval: Duration::from_millis(10),
        timeout: Some(Duration::from_secs(5)),
        not_found_grace: Duration::from_millis(200),
    }
}

fn video_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("holiday.mp4");
    std::fs::write(&path, b"not really a video").unwrap();
    path
}

#[tokio::test]
async fn upload_then_poll_until_completed() {
    let (client, _uploads) = spawn_api(Behavior::Succeed, false).await;
    let source = tempfile::tempdir().unwrap();

    let task_id = client.upload(&video_file(&source)).await.unwrap();
    let mut seen = Vec::new();
    let done = client
        .wait_for_completion(&task_id, &fast_polling(), |status| seen.push(status.status))
        .await
        .unwrap();

    assert_eq!(done.task_id, task_id);
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.title.as_deref(), Some("holiday.mp4"));
    assert_eq!(
        done.video_url,
        Some(format!("https://cdn.example/{task_id}_holiday.mp4"))
    );
    assert_eq!(seen.last(), Some(&TaskStatus::Completed));
    assert!(!seen.contains(&TaskStatus::NotFound));
}

#[tokio::test]
async fn polling_stops_on_failure() {
    let (client, _uploads) = spawn_api(Behavior::Fail, false).await;
    let source = tempfile::tempdir().unwrap();

    let task_id = client.upload(&video_file(&source)).await.unwrap();
    let done = client
        .wait_for_completion(&task_id, &fast_polling(), |_| {})
        .await
        .unwrap();

    assert_eq!(done.status, TaskStatus::Failed);
    assert!(done.video_url.is_none());
    assert!(done.error.unwrap().contains("unsupported codec"));
}

#[tokio::test]
async fn never_issued_task_is_lost_after_the_grace_period() {
    let (client, _uploads) = spawn_api(Behavior::Succeed, false).await;
    let options = PollOptions {
        not_found_grace: Duration::from_millis(100),
        ..fast_polling()
    };

    let started = Instant::now();
    let mut polls = 0;
    let err = client
        .wait_for_completion("never-issued", &options, |_| polls += 1)
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::NotFound(ref id) if id == "never-issued"));
    assert!(started.elapsed() >= options.not_found_grace);
    assert!(polls > 1, "not_found should be retried within the grace period");
}

#[derive(Clone, Default)]
struct LateRegistration {
    polls: Arc<AtomicUsize>,
}

async fn late_status(
    State(server): State<LateRegistration>,
    UrlPath(task_id): UrlPath<String>,
) -> Json<Value> {
    let poll = server.polls.fetch_add(1, Ordering::SeqCst);
    Json(match poll {
        0 | 1 => json!({ "task_id": task_id, "status": "not_found" }),
        2 => json!({ "task_id": task_id, "status": "in_progress" }),
        _ => json!({
            "task_id": task_id,
            "status": "completed",
            "videoUrl": "https://cdn.example/late.mp4",
            "title": "late.mp4",
        }),
    })
}

#[tokio::test]
async fn not_found_is_tolerated_within_the_grace_period() {
    let server = LateRegistration::default();
    let base_url = serve(
        Router::new()
            .route("/task-status/{task_id}", get(late_status))
            .with_state(server.clone()),
    )
    .await;
    let client = ApiClient::new(base_url);

    let mut seen = Vec::new();
    let done = client
        .wait_for_completion("late", &fast_polling(), |status| seen.push(status.status))
        .await
        .unwrap();

    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.video_url.as_deref(), Some("https://cdn.example/late.mp4"));
    assert_eq!(
        seen,
        [
            TaskStatus::NotFound,
            TaskStatus::NotFound,
            TaskStatus::InProgress,
            TaskStatus::Completed,
        ]
    );
    assert_eq!(server.polls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn unfinished_task_times_out() {
    let (client, _uploads) = spawn_api(Behavior::Hang, false).await;
    let source = tempfile::tempdir().unwrap();
    let options = PollOptions {
        timeout: Some(Duration::from_millis(100)),
        ..fast_polling()
    };

    let task_id = client.upload(&video_file(&source)).await.unwrap();
    let err = client
        .wait_for_completion(&task_id, &options, |_| {})
        .await
        .unwrap_err();

    match err {
        ClientError::Timeout {
            task_id: timed_out,
            status,
            waited,
        } => {
            assert_eq!(timed_out, task_id);
            assert!(matches!(status, TaskStatus::Pending | TaskStatus::InProgress));
            assert!(waited >= Duration::from_millis(100));
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn chat_and_reset_go_through_the_api() {
    let (client, _uploads) = spawn_api(Behavior::Succeed, false).await;

    let reply = client.chat("what is in it?", Some("ref://clip")).await.unwrap();
    assert_eq!(reply, "what is in it? (ref://clip)");
    assert_eq!(
        client.reset_memory().await.unwrap(),
        "Memory reset successfully"
    );
}

#[tokio::test]
async fn error_responses_become_api_errors() {
    let (client, _uploads) = spawn_api(Behavior::Succeed, true).await;

    let err = client.chat("hello", None).await.unwrap_err();
    match err {
        ClientError::Api { status, body } => {
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert!(body.contains("rate limited"), "{body}");
        }
        other => panic!("expected an api error, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_upload_source_is_an_io_error() {
    let (client, _uploads) = spawn_api(Behavior::Succeed, false).await;

    let err = client
        .upload(Path::new("/definitely/not/here.mp4"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Io(_)));
}
