use crate::services::{
    metadata_store::MetadataError, object_client::ObjectStoreError, reconciler::SweepError,
    upload_service::UploadError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 503 Service Unavailable
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), "{}", self.message);
        }

        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<MetadataError> for AppError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::DuplicateKey(_) => AppError::new(StatusCode::CONFLICT, err.to_string()),
            MetadataError::Timeout(_) => AppError::unavailable(err.to_string()),
            MetadataError::Persistence(_) => AppError::internal(err.to_string()),
        }
    }
}

impl From<ObjectStoreError> for AppError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ref e if e.is_not_found() => AppError::not_found("File not found or expired"),
            ObjectStoreError::InvalidKey(_) => AppError::bad_request(err.to_string()),
            ObjectStoreError::Timeout(_) => AppError::unavailable(err.to_string()),
            _ => AppError::internal(err.to_string()),
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Store(inner) => inner.into(),
            UploadError::Registration(inner) => inner.into(),
        }
    }
}

impl From<SweepError> for AppError {
    fn from(err: SweepError) -> Self {
        match err {
            SweepError::AlreadyRunning => AppError::new(StatusCode::CONFLICT, err.to_string()),
            _ => AppError::unavailable(err.to_string()),
        }
    }
}
