use actix_web::{delete, post, web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::AppError,
    middleware::guards::User,
    models::{Attachment, NewClassMessage, NewDirectMessage},
    state::AppState,
};

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub receiver_id: Uuid,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// POST /api/v1/messages
#[post("/api/v1/messages")]
pub async fn send_message(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let message = state
        .messaging
        .send_direct(NewDirectMessage {
            sender_id: user.id,
            receiver_id: body.receiver_id,
            content: body.content,
            attachments: body.attachments,
            parent_id: None,
        })
        .await?;
    Ok(HttpResponse::Created().json(message))
}

/// POST /api/v1/messages/{id}/reply
#[post("/api/v1/messages/{id}/reply")]
pub async fn reply_to_message(
    state: web::Data<AppState>,
    parent_id: web::Path<Uuid>,
    user: User,
    body: web::Json<MessageBody>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let message = state
        .messaging
        .reply(user.id, parent_id.into_inner(), body.content, body.attachments)
        .await?;
    Ok(HttpResponse::Created().json(message))
}

/// POST /api/v1/messages/{id}/read
#[post("/api/v1/messages/{id}/read")]
pub async fn mark_message_read(
    state: web::Data<AppState>,
    message_id: web::Path<Uuid>,
    user: User,
) -> Result<HttpResponse, AppError> {
    state
        .messaging
        .mark_read(user.id, message_id.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

/// POST /api/v1/messages/{id}/delivered
/// Delivery ack for clients that fetched the message over HTTP
#[post("/api/v1/messages/{id}/delivered")]
pub async fn ack_message_delivered(
    state: web::Data<AppState>,
    message_id: web::Path<Uuid>,
    user: User,
) -> Result<HttpResponse, AppError> {
    state
        .messaging
        .acknowledge_delivered(user.id, message_id.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

/// DELETE /api/v1/messages/{id}
#[delete("/api/v1/messages/{id}")]
pub async fn delete_message(
    state: web::Data<AppState>,
    message_id: web::Path<Uuid>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let message = state
        .messaging
        .delete_message(user.id, message_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(message))
}

/// POST /api/v1/classes/{class_id}/messages
#[post("/api/v1/classes/{class_id}/messages")]
pub async fn send_class_message(
    state: web::Data<AppState>,
    class_id: web::Path<Uuid>,
    user: User,
    body: web::Json<MessageBody>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let message = state
        .messaging
        .send_class(NewClassMessage {
            sender_id: user.id,
            class_id: class_id.into_inner(),
            content: body.content,
            attachments: body.attachments,
        })
        .await?;
    Ok(HttpResponse::Created().json(message))
}
