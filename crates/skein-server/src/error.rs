use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use skein_kernel::KernelError;

use crate::models::ErrorBody;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("session {0} already exists")]
    SessionExists(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("artifact {0} not found")]
    ArtifactNotFound(String),
    #[error("no active stream for execution {0}")]
    StreamNotFound(String),
    #[error("API key required")]
    AuthRequired,
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Single place where error kinds map to HTTP status codes.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::SessionExists(_) => StatusCode::CONFLICT,
            ApiError::SessionNotFound(_)
            | ApiError::ArtifactNotFound(_)
            | ApiError::StreamNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AuthRequired | ApiError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Kernel(err) => match err {
                KernelError::PathTraversal(_) | KernelError::PluginLoadFailed(_) => {
                    StatusCode::BAD_REQUEST
                }
                KernelError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::SessionExists("s".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::SessionNotFound("s".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::AuthRequired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Kernel(KernelError::PathTraversal("../x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Kernel(KernelError::Timeout).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
