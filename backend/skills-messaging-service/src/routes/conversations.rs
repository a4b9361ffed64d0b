use actix_web::{get, post, web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{error::AppError, middleware::guards::User, models::Page, state::AppState};

#[derive(Deserialize)]
pub struct SyncQuery {
    #[serde(default)]
    pub last_known_sequence: i64,
}

/// GET /api/v1/conversations
#[get("/api/v1/conversations")]
pub async fn get_conversations(
    state: web::Data<AppState>,
    user: User,
    page: web::Query<Page>,
) -> Result<HttpResponse, AppError> {
    let conversations = state
        .messaging
        .get_conversations(user.id, page.into_inner().normalized())
        .await?;
    Ok(HttpResponse::Ok().json(conversations))
}

/// GET /api/v1/conversations/{partner_id}/messages
#[get("/api/v1/conversations/{partner_id}/messages")]
pub async fn get_messages(
    state: web::Data<AppState>,
    partner_id: web::Path<Uuid>,
    user: User,
    page: web::Query<Page>,
) -> Result<HttpResponse, AppError> {
    let messages = state
        .messaging
        .list_messages(user.id, partner_id.into_inner(), page.into_inner().normalized())
        .await?;
    Ok(HttpResponse::Ok().json(messages))
}

/// POST /api/v1/conversations/{partner_id}/read
#[post("/api/v1/conversations/{partner_id}/read")]
pub async fn mark_conversation_read(
    state: web::Data<AppState>,
    partner_id: web::Path<Uuid>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let pointer = state
        .messaging
        .mark_conversation_read(user.id, partner_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "last_read_sequence": pointer })))
}

/// GET /api/v1/conversations/{partner_id}/sync?last_known_sequence=
#[get("/api/v1/conversations/{partner_id}/sync")]
pub async fn sync_messages(
    state: web::Data<AppState>,
    partner_id: web::Path<Uuid>,
    user: User,
    query: web::Query<SyncQuery>,
) -> Result<HttpResponse, AppError> {
    let response = state
        .sync
        .sync_missed_messages(user.id, partner_id.into_inner(), query.last_known_sequence)
        .await?;
    Ok(HttpResponse::Ok().json(response))
}
