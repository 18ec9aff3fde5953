use std::io;
use std::path::Path as FsPath;

use axum::{
    extract::{
        multipart::{Field, MultipartError},
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::HeaderValue,
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tower_http::cors::{AllowHeaders, AllowMethods, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::processor::VideoJob;
use crate::schema::{
    ChatRequest, ChatResponse, HealthResponse, MessageResponse, ProcessVideoResponse,
    TaskStatusResponse,
};
use crate::state::AppState;
use crate::task::TaskId;

const UPLOAD_FIELD: &str = "file";

pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route(
            "/process-video",
            post(process_video).layer(DefaultBodyLimit::disable()),
        )
        .route("/task-status/{task_id}", get(task_status))
        .route("/chat", post(chat))
        .route("/reset-memory", post(reset_memory))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Restricts CORS to `origins` when any of them parse, with credentials
/// allowed. Falls back to a credential-less wildcard when the list is
/// empty, unparsable or contains `*`.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let wildcard = origins.iter().any(|origin| origin.trim() == "*");
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();

    if wildcard || origins.is_empty() {
        warn!("no restricted CORS origins configured; allowing any origin");
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

async fn root() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "Welcome to the video agent API. Upload a video to /process-video to begin."
            .to_string(),
    })
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: "agent-api".to_string(),
        tasks: state.registry.len(),
        in_flight: state.processor.in_flight(),
    })
}

async fn process_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<ProcessVideoResponse>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("failed to read multipart field: {e}")))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let file_name = field
            .file_name()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or("upload.mp4")
            .to_string();
        let title = base_name(&file_name);
        let task_id = TaskId::new();
        let path = state
            .upload_dir
            .join(format!("{task_id}_{}", sanitize_file_name(&title)));

        let size = store_upload(field, &path, state.max_upload_bytes).await?;
        info!(
            task_id = %task_id,
            path = %path.display(),
            size_bytes = size,
            "stored uploaded video"
        );

        state.processor.schedule(VideoJob {
            task_id: task_id.clone(),
            path,
            title,
        });

        return Ok(Json(ProcessVideoResponse {
            message: "Task enqueued for processing".to_string(),
            task_id: task_id.to_string(),
        }));
    }

    Err(AppError::BadRequest(format!(
        "missing `{UPLOAD_FIELD}` field in multipart body"
    )))
}

/// Streams one multipart field to a new file at `path`, refusing to
/// overwrite an existing file. Partial files are removed on failure.
///
/// A body that breaks off mid-field is the client's fault and answers 400;
/// only local write failures are reported as upload errors.
async fn store_upload(field: Field<'_>, path: &FsPath, limit: usize) -> AppResult<u64> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(AppError::Upload)?;

    let reader = StreamReader::new(field.map_err(io::Error::other));
    let mut reader = std::pin::pin!(reader.take((limit as u64).saturating_add(1)));

    let copied = async {
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok::<_, io::Error>(written)
    }
    .await;

    let outcome = match copied {
        Ok(written) if written > limit as u64 => Err(AppError::PayloadTooLarge { limit }),
        Ok(written) => Ok(written),
        Err(e) => match e.get_ref().and_then(|inner| inner.downcast_ref::<MultipartError>()) {
            Some(multipart) => Err(AppError::BadRequest(format!(
                "failed to read uploaded file: {multipart}"
            ))),
            None => Err(AppError::Upload(e)),
        },
    };
    if outcome.is_err() {
        drop(file);
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "failed to remove partial upload");
        }
    }
    outcome
}

async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Json<TaskStatusResponse> {
    let snapshot = state.registry.get(&TaskId::from(task_id.as_str()));
    Json(TaskStatusResponse::new(task_id, snapshot))
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> AppResult<Json<ChatResponse>> {
    if let Err(e) = state.agent.setup().await {
        warn!(error = %e, "agent setup failed; continuing without tools");
    }

    let video_path = req.video_path.as_deref().filter(|p| !p.trim().is_empty());
    let response = state.agent.chat(&req.message, video_path).await?;
    Ok(Json(ChatResponse { response }))
}

async fn reset_memory(State(state): State<AppState>) -> Json<MessageResponse> {
    state.agent.reset_memory().await;
    Json(MessageResponse {
        message: "Memory reset successfully".to_string(),
    })
}

/// Final path component of a client-supplied file name, accepting both
/// `/` and `\` separators.
fn base_name(file_name: &str) -> String {
    let name = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
        .trim();
    if name.is_empty() || name == "." || name == ".." {
        "upload.mp4".to_string()
    } else {
        name.to_string()
    }
}

/// Keeps file names to a safe character set so they cannot escape the
/// upload directory.
fn sanitize_file_name(file_name: &str) -> String {
    file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
