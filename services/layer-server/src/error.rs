//! Error responses for layer requests

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for layer handlers
pub type LayerResult<T> = Result<T, LayerError>;

/// Errors returned to registry clients
#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    /// Layer not found in storage
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// The request did not address a layer
    #[error("unsupported path: {0}")]
    Unsupported(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[source] storage::StorageError),
}

impl LayerError {
    /// Map a storage failure for `digest`, keeping not-found distinct.
    pub fn from_storage(digest: &str, error: storage::StorageError) -> Self {
        if error.is_not_found() {
            LayerError::BlobNotFound(digest.to_owned())
        } else {
            LayerError::Storage(error)
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            LayerError::BlobNotFound(_) | LayerError::Unsupported(_) => StatusCode::NOT_FOUND,
            LayerError::InvalidDigest(_) | LayerError::InvalidRepository(_) => {
                StatusCode::BAD_REQUEST
            }
            LayerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            LayerError::BlobNotFound(_) => "BLOB_UNKNOWN",
            LayerError::InvalidDigest(_) => "DIGEST_INVALID",
            LayerError::InvalidRepository(_) => "NAME_INVALID",
            LayerError::Unsupported(_) => "UNSUPPORTED",
            LayerError::Storage(_) => "UNKNOWN",
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for LayerError {
    fn into_response(self) -> Response {
        if let LayerError::Storage(error) = &self {
            tracing::error!(%error, kind = %error.kind(), "failed to serve layer");
        }

        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        (status, axum::Json(body)).into_response()
    }
}
