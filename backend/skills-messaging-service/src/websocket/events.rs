//! WebSocket frames. Every frame is `{"event": "<name>", "data": {...}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Attachment, Message, ReceiptStatus};
use crate::services::sync::SyncResponse;

/// Client -> server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Direct message; `parent_id` turns it into a reply
    #[serde(rename = "message:send")]
    MessageSend {
        receiver_id: Uuid,
        #[serde(default)]
        content: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
        #[serde(default)]
        parent_id: Option<Uuid>,
        /// Echoed back in `message:sent` so the client can match its optimistic copy
        #[serde(default)]
        client_ref: Option<String>,
    },
    #[serde(rename = "message:ack:delivered")]
    MessageAckDelivered { message_id: Uuid },
    #[serde(rename = "message:read")]
    MessageRead { message_id: Uuid },
    #[serde(rename = "conversation:read")]
    ConversationRead { partner_id: Uuid },
    #[serde(rename = "typing:start")]
    TypingStart { to_user_id: Uuid },
    #[serde(rename = "typing:stop")]
    TypingStop { to_user_id: Uuid },
    #[serde(rename = "sync:request")]
    SyncRequest {
        partner_id: Uuid,
        #[serde(default)]
        last_known_sequence: i64,
    },
    #[serde(rename = "connection:ready")]
    ConnectionReady,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptNotice {
    pub message_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub sequence_number: Option<i64>,
    pub status: ReceiptStatus,
    pub reader_id: Uuid,
    pub at: DateTime<Utc>,
}

/// Server -> client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew(Message),
    /// Confirmation to the sender's connection, with the assigned sequence
    #[serde(rename = "message:sent")]
    MessageSent {
        client_ref: Option<String>,
        message: Message,
    },
    #[serde(rename = "message:receipt")]
    MessageReceipt(ReceiptNotice),
    #[serde(rename = "typing:start")]
    TypingStart { from_user_id: Uuid },
    #[serde(rename = "typing:stop")]
    TypingStop { from_user_id: Uuid },
    #[serde(rename = "user:status")]
    UserStatus {
        user_id: Uuid,
        online: bool,
        at: DateTime<Utc>,
    },
    #[serde(rename = "sync:response")]
    SyncResponse(SyncResponse),
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn error(err: &AppError) -> Self {
        let message = match err {
            AppError::Database(_) | AppError::Queue(_) | AppError::Config(_) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        ServerEvent::Error {
            code: err.code().to_string(),
            message,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::MessageNew(_) => "message:new",
            ServerEvent::MessageSent { .. } => "message:sent",
            ServerEvent::MessageReceipt(_) => "message:receipt",
            ServerEvent::TypingStart { .. } => "typing:start",
            ServerEvent::TypingStop { .. } => "typing:stop",
            ServerEvent::UserStatus { .. } => "user:status",
            ServerEvent::SyncResponse(_) => "sync:response",
            ServerEvent::Error { .. } => "error",
        }
    }
}
