use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Malformed wire payload. Never retried.
    #[error("Invalid request format: {0}")]
    InvalidFormat(String),

    /// Every routing candidate failed or none was configured.
    #[error("No channel available: {0}")]
    NoChannelAvailable(String),

    /// A provider call failed or timed out. Triggers failover.
    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    pub fn not_found(what: impl Into<String>) -> Self {
        AppError::NotFound(what.into())
    }

    pub fn invalid_format(e: impl std::fmt::Display) -> Self {
        AppError::InvalidFormat(e.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyExists(_) => StatusCode::CONFLICT,
            AppError::BadRequest(_) | AppError::InvalidFormat(_) => StatusCode::BAD_REQUEST,
            AppError::NoChannelAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Upstream(_) | AppError::Reqwest(_) => StatusCode::BAD_GATEWAY,
            AppError::Persistence(_)
            | AppError::Internal(_)
            | AppError::Sqlx(_)
            | AppError::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Persistence(e) => {
                tracing::error!("Persistence error: {}", e);
                "Internal server error".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
            AppError::Sqlx(e) => {
                tracing::error!("Database error: {}", e);
                "Internal server error".to_string()
            }
            AppError::Anyhow(e) => {
                tracing::error!("Error: {}", e);
                "Internal server error".to_string()
            }
            AppError::Reqwest(e) => {
                tracing::error!("HTTP client error: {}", e);
                "Upstream service error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({ "error": { "message": message } }));
        (status, body).into_response()
    }
}
