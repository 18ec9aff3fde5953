use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

use crate::agent::AgentError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("upload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },

    #[error("failed to store uploaded video: {0}")]
    Upload(#[source] std::io::Error),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::PayloadTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            Self::Upload(err) => {
                error!(error = %err, "upload could not be stored");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to store uploaded video".to_string(),
                )
            }
            Self::Agent(err) => {
                error!(error = %err, "agent call failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        (status, Json(serde_json::json!({ "ok": false, "error": message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
