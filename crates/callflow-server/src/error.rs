//! API error envelope and storage helpers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use callflow_calls::CallError;
use callflow_db::DbPool;
use callflow_transcript::TranscriptError;
use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;

/// How urgently an operator should look at an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest { code: &'static str, message: String },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("stream closed: {0}")]
    Gone(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl ApiError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Gone(_) => StatusCode::GONE,
            Self::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest { code, .. } => *code,
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Gone(_) => "STREAM_CLOSED",
            Self::InternalServerError(_) => "INTERNAL_ERROR",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::BadRequest { .. } | Self::NotFound(_) | Self::Gone(_) => Severity::Low,
            Self::Unauthorized(_) => Severity::Medium,
            Self::InternalServerError(_) => Severity::High,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_id = format!("err_{}", uuid::Uuid::new_v4().simple());
        let status = self.status();

        // Internal details stay in the log; the client gets the id to quote.
        let message = match &self {
            Self::InternalServerError(detail) => {
                tracing::error!(error_id = %error_id, error = %detail, "request failed");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(serde_json::json!({
            "success": false,
            "error": {
                "id": error_id,
                "code": self.code(),
                "message": message,
                "severity": self.severity(),
            }
        }));

        (status, body).into_response()
    }
}

/// Failure of a blocking database task.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("db connection failed: {0}")]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Transcript(#[from] TranscriptError),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Call(CallError::NotFound(id)) => ApiError::NotFound(format!("call {id}")),
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

/// Runs `f` against a pooled connection on the blocking thread pool.
pub(crate) async fn with_conn<T, F>(pool: &DbPool, f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        f(&conn)
    })
    .await?
}
