use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("validation failed: {0}")]
    Validation(#[from] garde::Report),
    #[error("{0}")]
    UnprocessableEntity(String),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("conflict")]
    Conflict,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("too many requests")]
    TooManyRequests,
    #[error(transparent)]
    JsonRejection(#[from] JsonRejection),
    #[error(transparent)]
    QueryRejection(#[from] QueryRejection),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<crate::models::Error> for ApiError {
    fn from(err: crate::models::Error) -> Self {
        use crate::models::Error;
        match err {
            Error::NotFound(_) => ApiError::NotFound,
            Error::Conflict => ApiError::Conflict,
            Error::BadRequest(message) => ApiError::UnprocessableEntity(message),
            Error::ForeignKeyViolation => ApiError::UnprocessableEntity(
                "referenced entity does not exist".to_string(),
            ),
            Error::Database(e) => ApiError::Database(e),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<crate::queue::QueueError> for ApiError {
    fn from(err: crate::queue::QueueError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response<axum::body::Body> {
        let (status, message) = match &self {
            ApiError::Database(e) => {
                error!("API database error: {e:?}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            ApiError::Internal(e) => {
                error!("API internal error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            ApiError::Validation(report) => {
                (StatusCode::UNPROCESSABLE_ENTITY, report.to_string())
            }
            ApiError::UnprocessableEntity(message) => {
                (StatusCode::UNPROCESSABLE_ENTITY, message.clone())
            }
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::Conflict => (StatusCode::CONFLICT, "conflict".to_string()),
            ApiError::PayloadTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload too large".to_string())
            }
            ApiError::TooManyRequests => {
                (StatusCode::TOO_MANY_REQUESTS, "too many requests, try again later".to_string())
            }
            ApiError::JsonRejection(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
            ApiError::QueryRejection(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        };

        debug!("API error response: {status} {message}");
        (status, Json(json!({ "error": message }))).into_response()
    }
}
