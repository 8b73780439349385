use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::{coordinate::InvalidCoordinate, scheduler::SweepError, store::StoreError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid coordinates provided")]
    InvalidCoordinate(#[from] InvalidCoordinate),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    StorageUnavailable(#[from] StoreError),

    #[error("A backup sweep is already running")]
    SweepInProgress,

    #[error("Backup sweep timed out")]
    SweepTimedOut,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<SweepError> for AppError {
    fn from(err: SweepError) -> Self {
        match err {
            SweepError::AlreadyRunning => AppError::SweepInProgress,
            SweepError::TimedOut(_) => AppError::SweepTimedOut,
            SweepError::Fleet(e) => AppError::StorageUnavailable(e),
            SweepError::TaskFailed(reason) => AppError::Internal(reason),
        }
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MalformedPayload { .. } => StatusCode::BAD_REQUEST,
            AppError::InvalidCoordinate { .. } => StatusCode::BAD_REQUEST,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::StorageUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::SweepInProgress => StatusCode::CONFLICT,
            AppError::SweepTimedOut => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        (
            status,
            Json(json!({
                "success": false,
                "error": self.to_string(),
            })),
        )
            .into_response()
    }
}
