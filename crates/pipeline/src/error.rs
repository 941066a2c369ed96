//! Error taxonomy for the generation pipeline.
//!
//! `PipelineError` is what every coordinator operation returns. The HTTP
//! layer turns it into an [`AppError`] so each class lands on a stable status
//! code. `MaterializationError` stays separate: a failed download never
//! escalates into a pipeline failure.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad input or an unmet stage precondition. Raised before any external call.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// A task for the same unit and stage is still running.
    #[error("{0}")]
    Conflict(String),

    /// The provider or LLM answered with an application-level failure.
    #[error("provider error: {0}")]
    Provider(String),

    /// The collaborator could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Provider(format!("malformed response: {err}"))
        } else {
            Self::Transport(err.to_string())
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum MaterializationError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("fetch returned {0}")]
    Status(reqwest::StatusCode),

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not record local copy: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value)
    }
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        match value {
            PipelineError::Validation(msg) => Self::BadRequest(msg),
            PipelineError::NotFound(msg) => Self::NotFound(msg),
            PipelineError::Conflict(msg) => Self::Conflict(msg),
            err @ (PipelineError::Provider(_) | PipelineError::Transport(_)) => {
                Self::BadGateway(err.to_string())
            }
            PipelineError::Store(err) => Self::Internal(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::BadGateway(msg) => {
                tracing::warn!(error = %msg, "upstream call failed");
                (StatusCode::BAD_GATEWAY, msg)
            }
            Self::Internal(err) => {
                tracing::error!(error = ?err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "ok": false, "error": message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
