use actix_web::{get, web, HttpResponse};
use serde::Deserialize;

use crate::{error::AppError, middleware::guards::User, state::AppState};

#[derive(Deserialize)]
pub struct DeadLetterQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// GET /api/v1/admin/queues
#[get("/api/v1/admin/queues")]
pub async fn queue_stats(
    state: web::Data<AppState>,
    _user: User,
) -> Result<HttpResponse, AppError> {
    let stats = state.delivery.queue_stats().await?;
    Ok(HttpResponse::Ok().json(stats))
}

/// GET /api/v1/admin/queues/dead-letters
#[get("/api/v1/admin/queues/dead-letters")]
pub async fn dead_letters(
    state: web::Data<AppState>,
    _user: User,
    query: web::Query<DeadLetterQuery>,
) -> Result<HttpResponse, AppError> {
    let jobs = state
        .delivery
        .dead_letters(query.limit.clamp(1, 500))
        .await?;
    Ok(HttpResponse::Ok().json(jobs))
}
