use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A direct conversation between exactly two users.
///
/// `participant_a < participant_b` always holds, so each pair maps to one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participant_a: Uuid,
    pub participant_b: Uuid,
    pub current_sequence: i64,
    pub participant_a_last_read: i64,
    pub participant_b_last_read: i64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_preview: Option<String>,
    pub last_message_sender_id: Option<Uuid>,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Sort a user pair into storage order
pub fn canonical_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl Conversation {
    pub fn involves(&self, user_id: Uuid) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }

    pub fn partner_of(&self, user_id: Uuid) -> Option<Uuid> {
        if self.participant_a == user_id {
            Some(self.participant_b)
        } else if self.participant_b == user_id {
            Some(self.participant_a)
        } else {
            None
        }
    }

    pub fn last_read_of(&self, user_id: Uuid) -> Option<i64> {
        if self.participant_a == user_id {
            Some(self.participant_a_last_read)
        } else if self.participant_b == user_id {
            Some(self.participant_b_last_read)
        } else {
            None
        }
    }

    pub fn unread_for(&self, user_id: Uuid) -> i64 {
        self.last_read_of(user_id)
            .map(|read| (self.current_sequence - read).max(0))
            .unwrap_or(0)
    }
}

/// Conversation as listed for one participant
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub partner_id: Uuid,
    pub unread_count: i64,
}

impl ConversationSummary {
    pub fn for_user(conversation: Conversation, user_id: Uuid) -> Option<Self> {
        let partner_id = conversation.partner_of(user_id)?;
        let unread_count = conversation.unread_for(user_id);
        Some(Self {
            conversation,
            partner_id,
            unread_count,
        })
    }
}
