use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("External service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// Failures of the device registry collaborator.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Recipient not found: {0}")]
    NotFound(String),

    #[error("Device registry unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for RegistryError {
    fn from(e: sqlx::Error) -> Self {
        RegistryError::Unavailable(e.to_string())
    }
}

/// Whole-invocation failures of a dispatch. Per-device problems never show up
/// here; they are folded into each device's outcome.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Recipient not found: {0}")]
    RecipientNotFound(String),

    #[error("Device registry unreachable: {0}")]
    RegistryUnreachable(String),

    #[error("Dispatch aggregation failed: {0}")]
    Aggregation(String),
}

impl From<RegistryError> for DispatchError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => DispatchError::RecipientNotFound(id),
            RegistryError::Unavailable(msg) => DispatchError::RegistryUnreachable(msg),
        }
    }
}

impl From<DispatchError> for AppError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::RecipientNotFound(id) => {
                AppError::NotFound(format!("Recipient {} not found", id))
            }
            DispatchError::RegistryUnreachable(msg) => AppError::ServiceUnavailable(msg),
            DispatchError::Aggregation(msg) => AppError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(e: RegistryError) -> Self {
        DispatchError::from(e).into()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                self.to_string(),
            ),
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                msg.clone(),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::ServiceUnavailable(msg) => {
                tracing::error!("Service unavailable: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    msg.clone(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_errors_map_to_dispatch_errors() {
        assert!(matches!(
            DispatchError::from(RegistryError::NotFound("r1".into())),
            DispatchError::RecipientNotFound(id) if id == "r1"
        ));
        assert!(matches!(
            DispatchError::from(RegistryError::Unavailable("down".into())),
            DispatchError::RegistryUnreachable(_)
        ));
    }

    #[test]
    fn dispatch_errors_map_to_http_statuses() {
        let resp = AppError::from(DispatchError::RecipientNotFound("r1".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = AppError::from(DispatchError::RegistryUnreachable("down".into())).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
