use actix_web::web;

pub mod admin;
pub mod conversations;
pub mod messages;
pub mod wsroute;

use crate::metrics;

async fn health() -> &'static str {
    "OK"
}

/// Register every route on an `App`
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(messages::send_message)
        .service(messages::reply_to_message)
        .service(messages::mark_message_read)
        .service(messages::ack_message_delivered)
        .service(messages::delete_message)
        .service(messages::send_class_message)
        .service(conversations::get_conversations)
        .service(conversations::get_messages)
        .service(conversations::mark_conversation_read)
        .service(conversations::sync_messages)
        .service(admin::queue_stats)
        .service(admin::dead_letters)
        .service(wsroute::ws_handler)
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics::metrics_handler));
}
