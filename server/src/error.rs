//! Unified error handling for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Sync error: {0}")]
    Sync(#[from] accord_engine::SyncError),

    #[error("Stored row is corrupt: {0}")]
    CorruptRow(#[from] accord_engine::DecodeError),

    #[error("Storage worker is not running")]
    WorkerUnavailable,
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::Sync(e) => {
                tracing::warn!("Sync error: {:?}", e);
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            AppError::CorruptRow(e) => {
                tracing::error!("Corrupt row: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::WorkerUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Storage worker unavailable".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
