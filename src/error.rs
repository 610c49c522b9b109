//! Error type for registry and sweep operations.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::db::DbError;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("another target already uses {0}")]
    DuplicateUrl(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let status = match &self {
            MonitorError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            MonitorError::DuplicateUrl(_) => StatusCode::CONFLICT,
            MonitorError::Db(_) | MonitorError::Transport(_) | MonitorError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, axum::Json(json!({ "error": self.to_string() }))).into_response()
    }
}
