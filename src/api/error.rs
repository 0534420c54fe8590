use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::errors::{DomainError, ServiceError, SyncError};

/// Error surface of the HTTP gateway. Wraps service errors and maps them to
/// status codes; the body always carries the standard envelope.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            log::error!("request failed ({}): {}", self.code, self.message);
        }
        let body = json!({
            "success": false,
            "data": serde_json::Value::Null,
            "error": ErrorBody { code: self.code, message: self.message },
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Domain(domain) => domain.into(),
            ServiceError::Configuration(message) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "configuration",
                message,
            },
            ServiceError::ServiceUnavailable(message) => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "unavailable",
                message,
            },
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match &err {
            DomainError::Validation(_) | DomainError::InvalidUuid(_) => Self {
                status: StatusCode::BAD_REQUEST,
                code: "validation",
                message: err.to_string(),
            },
            DomainError::EntityNotFound(_, _) => Self {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message: err.to_string(),
            },
            DomainError::Sync(sync) => match sync {
                SyncError::InvalidBatch(_) => Self {
                    status: StatusCode::BAD_REQUEST,
                    code: "invalid_batch",
                    message: err.to_string(),
                },
                SyncError::InvalidState { .. } => Self {
                    status: StatusCode::CONFLICT,
                    code: "invalid_state",
                    message: err.to_string(),
                },
                SyncError::RecordNotFound(_) => Self {
                    status: StatusCode::NOT_FOUND,
                    code: "not_found",
                    message: err.to_string(),
                },
                SyncError::DuplicateKey(_) => Self {
                    status: StatusCode::CONFLICT,
                    code: "duplicate_key",
                    message: err.to_string(),
                },
                SyncError::RetryLimitExceeded { .. } => Self {
                    status: StatusCode::CONFLICT,
                    code: "retry_limit",
                    message: err.to_string(),
                },
                SyncError::NoHandler(_) | SyncError::Other(_) => {
                    Self::internal(err.to_string())
                }
            },
            DomainError::Database(_) | DomainError::Internal(_) => {
                Self::internal(err.to_string())
            }
        }
    }
}
