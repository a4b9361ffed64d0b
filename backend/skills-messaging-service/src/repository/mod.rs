//! Persistence for conversations and messages.
//!
//! Two implementations share these traits: [`PgStore`] for production and
//! [`MemoryStore`] for tests and single-node development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    Conversation, ConversationSummary, Message, NewClassMessage, NewDirectMessage, Page,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Per-pair conversation records, their sequence counter and read pointers.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Return the conversation for the pair, creating it on first use.
    ///
    /// `(a, b)` and `(b, a)` always resolve to the same row.
    async fn get_or_create(&self, a: Uuid, b: Uuid) -> AppResult<Conversation>;

    /// Lookup without creating.
    async fn find_between(&self, a: Uuid, b: Uuid) -> AppResult<Option<Conversation>>;

    async fn get_conversation(&self, id: Uuid) -> AppResult<Option<Conversation>>;

    /// Atomically increment `current_sequence` and return the new value.
    ///
    /// Only meaningful as part of message creation; a value allocated here
    /// without a message leaves a hole in the sequence.
    async fn allocate_sequence(&self, conversation_id: Uuid) -> AppResult<i64>;

    /// Move the user's read pointer forward to `sequence`.
    ///
    /// Never decreases the pointer and never moves it past `current_sequence`.
    /// Returns the stored pointer after the update.
    async fn advance_read_pointer(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        sequence: i64,
    ) -> AppResult<i64>;

    /// Conversations of `user_id`, most recent activity first.
    async fn list_for_user(&self, user_id: Uuid, page: Page)
        -> AppResult<Vec<ConversationSummary>>;

    /// Everyone `user_id` has a conversation with.
    async fn partner_ids(&self, user_id: Uuid) -> AppResult<Vec<Uuid>>;
}

/// Durable message records.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Allocate the next sequence number for the pair's conversation and
    /// persist the message in one atomic step.
    ///
    /// The conversation's `current_sequence`, `last_message_*` and
    /// `message_count` are updated in the same step. Returns the updated
    /// conversation along with the message.
    async fn create_direct(&self, new: NewDirectMessage) -> AppResult<(Conversation, Message)>;

    /// Class-scope message: no conversation, no sequence.
    async fn create_class(&self, new: NewClassMessage) -> AppResult<Message>;

    async fn get_message(&self, id: Uuid) -> AppResult<Option<Message>>;

    /// Set `delivered_at` if unset. Returns the row after the update.
    async fn mark_delivered(&self, id: Uuid, when: DateTime<Utc>) -> AppResult<Option<Message>>;

    /// Set `read_at` (and `delivered_at`) if unset. Returns the row after the update.
    async fn mark_read(&self, id: Uuid, when: DateTime<Utc>) -> AppResult<Option<Message>>;

    /// Mark every message addressed to `reader_id` with sequence `<= up_to` as read.
    /// Returns the ids that changed.
    async fn mark_read_up_to(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
        up_to: i64,
        when: DateTime<Utc>,
    ) -> AppResult<Vec<Uuid>>;

    /// Soft delete. `Forbidden` unless `requester_id` sent the message.
    async fn soft_delete(&self, id: Uuid, requester_id: Uuid) -> AppResult<Message>;

    /// Non-deleted messages ordered by sequence ascending.
    async fn list_by_conversation(
        &self,
        conversation_id: Uuid,
        page: Page,
    ) -> AppResult<Vec<Message>>;

    /// Messages with `sequence_number > since`, ascending, soft-deleted rows included.
    async fn list_missing_after(&self, conversation_id: Uuid, since: i64)
        -> AppResult<Vec<Message>>;
}

/// Everything the messaging services need from storage
pub trait MessagingStore: ConversationRepository + MessageRepository {}

impl<T: ConversationRepository + MessageRepository> MessagingStore for T {}
