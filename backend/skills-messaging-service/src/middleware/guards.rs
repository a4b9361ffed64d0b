//! Request extractors that authenticate before a handler runs

use actix_web::{dev::Payload, http::header, web, FromRequest, HttpRequest};
use serde::Deserialize;
use std::future::{ready, Ready};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Represents an authenticated user extracted from the JWT
#[derive(Debug, Clone, Copy)]
pub struct User {
    pub id: Uuid,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// `Authorization: Bearer <jwt>`, or `?token=<jwt>` for WebSocket clients
/// that cannot set headers.
fn bearer_token(req: &HttpRequest) -> Option<String> {
    let from_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string());

    from_header.or_else(|| {
        web::Query::<TokenQuery>::from_query(req.query_string())
            .ok()
            .and_then(|q| q.into_inner().token)
    })
}

pub fn authenticate(req: &HttpRequest) -> AppResult<User> {
    let state = req
        .app_data::<web::Data<AppState>>()
        .ok_or(AppError::Internal)?;
    let token = bearer_token(req).ok_or(AppError::Unauthorized)?;
    let id = state.auth.verify(&token)?;
    Ok(User { id })
}

impl FromRequest for User {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(authenticate(req))
    }
}
