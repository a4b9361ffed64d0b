use crate::error::AppError;
use actix_web::{http::StatusCode, HttpResponse};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

// Map domain errors to HTTP responses
pub fn map_error(err: &AppError) -> (StatusCode, ErrorBody) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    // Don't leak driver messages to clients
    let message = match err {
        AppError::Database(_) | AppError::Queue(_) | AppError::Config(_) => {
            tracing::error!(error = %err, "request failed");
            "internal server error".to_string()
        }
        _ => err.to_string(),
    };

    (
        status,
        ErrorBody {
            error: err.code(),
            message,
        },
    )
}

pub fn into_response(err: &AppError) -> HttpResponse {
    let (status, body) = map_error(err);
    HttpResponse::build(status).json(body)
}
