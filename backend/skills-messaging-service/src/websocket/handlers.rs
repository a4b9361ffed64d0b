use tracing::{debug, warn};
use uuid::Uuid;

use super::{ClientEvent, ServerEvent};
use crate::error::AppResult;
use crate::models::NewDirectMessage;
use crate::state::AppState;

/// Handle one inbound frame for `user_id`.
///
/// Returns the frame to send back on the same connection, if any. Failures
/// become an `error` frame; they never close the connection.
pub async fn handle_client_event(
    state: &AppState,
    user_id: Uuid,
    event: ClientEvent,
) -> Option<ServerEvent> {
    match dispatch(state, user_id, event).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "websocket event failed");
            Some(ServerEvent::error(&e))
        }
    }
}

async fn dispatch(
    state: &AppState,
    user_id: Uuid,
    event: ClientEvent,
) -> AppResult<Option<ServerEvent>> {
    match event {
        ClientEvent::MessageSend {
            receiver_id,
            content,
            attachments,
            parent_id,
            client_ref,
        } => {
            // for replies the parent decides the receiver
            let message = match parent_id {
                Some(parent_id) => {
                    state
                        .messaging
                        .reply(user_id, parent_id, content, attachments)
                        .await?
                }
                None => {
                    state
                        .messaging
                        .send_direct(NewDirectMessage {
                            sender_id: user_id,
                            receiver_id,
                            content,
                            attachments,
                            parent_id: None,
                        })
                        .await?
                }
            };
            Ok(Some(ServerEvent::MessageSent {
                client_ref,
                message,
            }))
        }
        ClientEvent::MessageAckDelivered { message_id } => {
            state
                .messaging
                .acknowledge_delivered(user_id, message_id)
                .await?;
            Ok(None)
        }
        ClientEvent::MessageRead { message_id } => {
            state.messaging.mark_read(user_id, message_id).await?;
            Ok(None)
        }
        ClientEvent::ConversationRead { partner_id } => {
            state
                .messaging
                .mark_conversation_read(user_id, partner_id)
                .await?;
            Ok(None)
        }
        ClientEvent::TypingStart { to_user_id } => {
            state.messaging.typing(user_id, to_user_id, true).await;
            Ok(None)
        }
        ClientEvent::TypingStop { to_user_id } => {
            state.messaging.typing(user_id, to_user_id, false).await;
            Ok(None)
        }
        ClientEvent::SyncRequest {
            partner_id,
            last_known_sequence,
        } => {
            let response = state
                .sync
                .sync_missed_messages(user_id, partner_id, last_known_sequence)
                .await?;
            Ok(Some(ServerEvent::SyncResponse(response)))
        }
        ClientEvent::ConnectionReady => {
            let flushed = state.sync.on_connection_ready(user_id).await?;
            debug!(user_id = %user_id, flushed, "connection ready");
            Ok(None)
        }
    }
}
