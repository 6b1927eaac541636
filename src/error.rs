use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// A legacy-only operation on a normalized eval (or the reverse).
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Inconsistent data: {0}")]
    InconsistentData(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    JobFailed(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Transport(e.to_string())
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Precondition(_) => StatusCode::CONFLICT,
            StoreError::InconsistentData(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StoreError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StoreError::Transport(_) => StatusCode::BAD_GATEWAY,
            StoreError::JobFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StoreError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Fails with `Precondition` when `cond` is false.
pub fn ensure(cond: bool, message: &str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(StoreError::Precondition(message.to_string()))
    }
}
