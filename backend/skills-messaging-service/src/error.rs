use crate::middleware::error_handling;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        error_handling::into_response(self)
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    /// Self-messaging, replying to a deleted message and similar.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Recipient unreachable at push time. Recovered by the offline queue.
    #[error("transient delivery failure: {0}")]
    TransientDeliveryFailure(String),

    /// Retry budget exhausted; the job was dead-lettered.
    #[error("permanent delivery failure: {0}")]
    PermanentDeliveryFailure(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("internal server error")]
    Internal,
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Queue(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Queue(format!("job payload: {e}"))
    }
}

impl AppError {
    /// Returns whether the failed operation may succeed if attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::TransientDeliveryFailure(_) => true,
            AppError::Database(msg) => {
                msg.contains("Timeout") || msg.contains("Closed") || msg.contains("Io")
            }
            AppError::Queue(msg) => msg.contains("broken pipe") || msg.contains("timed out"),
            AppError::Internal => true,
            _ => false,
        }
    }

    /// Stable machine-readable code used in error bodies and WebSocket `error` frames
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) | AppError::StartServer(_) => "server_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::NotFound => "not_found",
            AppError::InvalidOperation(_) => "invalid_operation",
            AppError::TransientDeliveryFailure(_) => "transient_delivery_failure",
            AppError::PermanentDeliveryFailure(_) => "permanent_delivery_failure",
            AppError::Database(_) => "database_error",
            AppError::Queue(_) => "queue_error",
            AppError::Internal => "internal_error",
        }
    }

    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized => 401,
            AppError::Forbidden => 403,
            AppError::NotFound => 404,
            AppError::InvalidOperation(_) => 422,
            AppError::Database(_) | AppError::Queue(_) | AppError::Internal => 500,
            _ => 500,
        }
    }
}
